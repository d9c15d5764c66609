//! Durable usage-record storage: every completed request is appended here
//! so the cost tracker can answer monthly/daily aggregate questions and
//! usage summaries span longer than the key-value store's TTL windows.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::provider::types::UserTier;

/// One completed request, as persisted for later aggregation. `id` is
/// the row identifier named in spec §6.2's `usage_records` schema.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub tier: UserTier,
    pub model: String,
    pub task_kind: String,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: DateTime<Utc>,
}

pub trait UsageStore: Send + Sync {
    fn record(&self, record: &UsageRecord) -> Result<()>;
    /// Sum of cost for `user_id` since `since` (inclusive).
    fn cost_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<f64>;
    /// Per-day total cost for `user_id` over the last `days` days, oldest first.
    fn daily_costs(&self, user_id: &str, days: u32) -> Result<Vec<(DateTime<Utc>, f64)>>;
    /// All records for `user_id` since `since`, for usage-summary aggregation.
    fn records_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<UsageRecord>>;
}

pub struct SqliteUsageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUsageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Store(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Store(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                model TEXT NOT NULL,
                task_kind TEXT NOT NULL,
                cost REAL NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_records_user_created
             ON usage_records (user_id, created_at)",
            [],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock usage store connection: {e}")))?;
        f(&conn).map_err(|e| Error::Store(e.to_string()))
    }

    fn tier_str(tier: UserTier) -> &'static str {
        match tier {
            UserTier::Free => "free",
            UserTier::Creator => "creator",
            UserTier::Business => "business",
            UserTier::Agency => "agency",
        }
    }

    fn tier_from_str(s: &str) -> UserTier {
        match s {
            "creator" => UserTier::Creator,
            "business" => UserTier::Business,
            "agency" => UserTier::Agency,
            _ => UserTier::Free,
        }
    }
}

impl UsageStore for SqliteUsageStore {
    fn record(&self, record: &UsageRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_records
                    (id, user_id, tier, model, task_kind, cost, input_tokens, output_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.user_id,
                    Self::tier_str(record.tier),
                    record.model,
                    record.task_kind,
                    record.cost,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn cost_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<f64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM usage_records
                 WHERE user_id = ?1 AND created_at >= ?2",
                params![user_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0.0))
        })
    }

    fn daily_costs(&self, user_id: &str, days: u32) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let since = Utc::now() - chrono::Duration::days(days as i64);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT substr(created_at, 1, 10) AS day, SUM(cost)
                 FROM usage_records
                 WHERE user_id = ?1 AND created_at >= ?2
                 GROUP BY day
                 ORDER BY day ASC",
            )?;
            let rows = stmt.query_map(params![user_id, since.to_rfc3339()], |row| {
                let day: String = row.get(0)?;
                let cost: f64 = row.get(1)?;
                Ok((day, cost))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (day, cost) = row?;
                let parsed = chrono::NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
                if let Some(ts) = parsed {
                    out.push((ts, cost));
                }
            }
            Ok(out)
        })
    }

    fn records_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, tier, model, task_kind, cost, input_tokens, output_tokens, created_at
                 FROM usage_records
                 WHERE user_id = ?1 AND created_at >= ?2
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![user_id, since.to_rfc3339()], |row| {
                let id_str: String = row.get(0)?;
                let tier_str: String = row.get(2)?;
                let created_at: String = row.get(8)?;
                Ok(UsageRecord {
                    id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
                    user_id: row.get(1)?,
                    tier: Self::tier_from_str(&tier_str),
                    model: row.get(3)?,
                    task_kind: row.get(4)?,
                    cost: row.get(5)?,
                    input_tokens: row.get::<_, i64>(6)? as u64,
                    output_tokens: row.get::<_, i64>(7)? as u64,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: &str, cost: f64) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            tier: UserTier::Creator,
            model: "deepseek-v3".to_string(),
            task_kind: "code_generation".to_string(),
            cost,
            input_tokens: 100,
            output_tokens: 200,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn records_accumulate_cost_for_user() {
        let store = SqliteUsageStore::in_memory().unwrap();
        store.record(&record("u1", 1.0)).unwrap();
        store.record(&record("u1", 2.0)).unwrap();
        store.record(&record("u2", 5.0)).unwrap();

        let since = Utc::now() - chrono::Duration::days(1);
        assert_eq!(store.cost_since("u1", since).unwrap(), 3.0);
        assert_eq!(store.cost_since("u2", since).unwrap(), 5.0);
    }

    #[test]
    fn cost_since_excludes_other_users() {
        let store = SqliteUsageStore::in_memory().unwrap();
        store.record(&record("u1", 1.0)).unwrap();
        let since = Utc::now() - chrono::Duration::days(1);
        assert_eq!(store.cost_since("nobody", since).unwrap(), 0.0);
    }

    #[test]
    fn records_since_returns_in_chronological_order() {
        let store = SqliteUsageStore::in_memory().unwrap();
        store.record(&record("u1", 1.0)).unwrap();
        store.record(&record("u1", 2.0)).unwrap();
        let since = Utc::now() - chrono::Duration::days(1);
        let records = store.records_since("u1", since).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].created_at <= records[1].created_at);
    }
}
