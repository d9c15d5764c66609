//! Real-time budget enforcement backed by a key-value store for cheap
//! counters and a durable usage store for the numbers that must survive
//! longer than any counter's TTL.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::store::{UsageRecord, UsageStore};
use crate::provider::types::UserTier;

/// Where a [`CostAlert`] sits on the budget-consumption ladder. Replaces
/// the source system's two overlapping `alert_type` strings
/// (`budget_warning` fired at both the 75% and 90% thresholds, each with
/// a different `severity`) with one ordered scale, plus a sibling
/// variant for the independent end-of-month projection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
    Exceeded,
    ProjectionWarning,
}

#[derive(Debug, Clone)]
pub struct CostAlert {
    pub user_id: String,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub current_value: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub user_id: String,
    pub tier: UserTier,
    pub monthly_limit: f64,
    pub current_usage: f64,
    pub remaining_budget: f64,
    pub percentage_used: f64,
    pub days_remaining: i64,
    pub projected_overage: Option<f64>,
}

/// Pre-flight answer to "can this request proceed under budget".
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub can_proceed: bool,
    pub current_usage: f64,
    pub monthly_limit: f64,
    pub remaining_budget: f64,
    pub estimated_cost: f64,
    pub after_request_usage: f64,
    pub remaining_requests_at_this_cost: u64,
    pub percentage_used: f64,
    pub would_exceed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UsageSummary {
    pub total_cost: f64,
    pub total_requests: u64,
    pub avg_cost_per_request: f64,
    pub model_breakdown: HashMap<String, f64>,
    pub task_breakdown: HashMap<String, f64>,
    pub daily_trend: Vec<(DateTime<Utc>, f64)>,
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0).unwrap()
}

fn days_remaining_in_month(now: DateTime<Utc>) -> i64 {
    let next_month_start = if now.month() == 12 {
        Utc.with_ymd_and_hms(now.year() + 1, 1, 1, 0, 0, 0).unwrap()
    } else {
        Utc.with_ymd_and_hms(now.year(), now.month() + 1, 1, 0, 0, 0).unwrap()
    };
    (next_month_start - now).num_days().max(0)
}

pub struct CostTracker {
    kv: Arc<dyn KeyValueStore>,
    store: Arc<dyn UsageStore>,
    config: Arc<BrokerConfig>,
}

impl CostTracker {
    pub fn new(kv: Arc<dyn KeyValueStore>, store: Arc<dyn UsageStore>, config: Arc<BrokerConfig>) -> Self {
        Self { kv, store, config }
    }

    /// Records a completed request's cost, refreshes the real-time
    /// counters, and returns an alert if the user's budget consumption
    /// has crossed a threshold since the last request.
    pub async fn track(
        &self,
        user_id: &str,
        tier: UserTier,
        model: &str,
        task_kind: &str,
        cost: f64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<Option<CostAlert>> {
        let now = Utc::now();
        self.store.record(&UsageRecord {
            id: uuid::Uuid::new_v4(),
            user_id: user_id.to_string(),
            tier,
            model: model.to_string(),
            task_kind: task_kind.to_string(),
            cost,
            input_tokens,
            output_tokens,
            created_at: now,
        })?;
        self.update_real_time_counters(user_id, cost, now).await?;

        let status = self.status(user_id, tier).await?;
        let alert = self.check_alerts(&status);
        if let Some(alert) = &alert {
            warn!(user_id, ?alert.severity, usage = status.current_usage, "budget alert");
        } else {
            info!(user_id, usage = status.current_usage, "request cost recorded");
        }
        Ok(alert)
    }

    async fn update_real_time_counters(&self, user_id: &str, cost: f64, now: DateTime<Utc>) -> Result<()> {
        let hourly_key = format!("cost:hourly:{}:{}", user_id, now.format("%Y-%m-%d-%H"));
        let daily_key = format!("cost:daily:{}:{}", user_id, now.format("%Y-%m-%d"));
        let monthly_key = format!("cost:monthly:{}:{}", user_id, now.format("%Y-%m"));
        let requests_key = format!("requests:daily:{}:{}", user_id, now.format("%Y-%m-%d"));

        self.kv.increment(&hourly_key, cost).await?;
        self.kv.expire(&hourly_key, Duration::hours(24)).await?;
        self.kv.increment(&daily_key, cost).await?;
        self.kv.expire(&daily_key, Duration::days(7)).await?;
        self.kv.increment(&monthly_key, cost).await?;
        self.kv.expire(&monthly_key, Duration::days(32)).await?;
        self.kv.increment(&requests_key, 1.0).await?;
        self.kv.expire(&requests_key, Duration::days(7)).await?;
        Ok(())
    }

    /// Current budget position for `user_id`, including an end-of-month
    /// overage projection based on the trailing 7-day daily average.
    pub async fn status(&self, user_id: &str, tier: UserTier) -> Result<BudgetStatus> {
        let now = Utc::now();
        let monthly_limit = self.config.monthly_limit(tier);
        let current_usage = self.store.cost_since(user_id, month_start(now))?;
        let remaining_budget = (monthly_limit - current_usage).max(0.0);
        let percentage_used = if monthly_limit > 0.0 {
            current_usage / monthly_limit * 100.0
        } else {
            0.0
        };
        let days_remaining = days_remaining_in_month(now);

        let projected_overage = if days_remaining > 0 && current_usage > 0.0 {
            const PROJECTION_WINDOW_DAYS: f64 = 7.0;
            let daily_costs = self.store.daily_costs(user_id, 7)?;
            // Average over the fixed 7-day window, not the count of days
            // that have a record — a user who only spent on one of the
            // last 7 days should not look 7x more expensive than they are.
            let daily_avg = daily_costs.iter().map(|(_, c)| c).sum::<f64>() / PROJECTION_WINDOW_DAYS;
            let projected_total = current_usage + daily_avg * days_remaining as f64;
            if projected_total > monthly_limit {
                Some(projected_total - monthly_limit)
            } else {
                None
            }
        } else {
            None
        };

        Ok(BudgetStatus {
            user_id: user_id.to_string(),
            tier,
            monthly_limit,
            current_usage,
            remaining_budget,
            percentage_used,
            days_remaining,
            projected_overage,
        })
    }

    fn check_alerts(&self, status: &BudgetStatus) -> Option<CostAlert> {
        let thresholds = &self.config.alert_thresholds;
        let fraction_used = status.percentage_used / 100.0;
        let now = Utc::now();

        let (severity, threshold) = if fraction_used >= thresholds.exceeded {
            (AlertSeverity::Exceeded, thresholds.exceeded)
        } else if fraction_used >= thresholds.critical {
            (AlertSeverity::Critical, thresholds.critical)
        } else if fraction_used >= thresholds.warning {
            (AlertSeverity::Warning, thresholds.warning)
        } else if let Some(overage) = status.projected_overage {
            return Some(CostAlert {
                user_id: status.user_id.clone(),
                severity: AlertSeverity::ProjectionWarning,
                threshold: thresholds.warning,
                current_value: fraction_used,
                message: format!(
                    "{} is on pace to exceed its monthly budget by ${:.2} based on recent usage",
                    status.user_id, overage
                ),
                timestamp: now,
            });
        } else {
            return None;
        };

        let message = match severity {
            AlertSeverity::Exceeded => format!(
                "{} has exceeded its monthly budget (${:.2} of ${:.2})",
                status.user_id, status.current_usage, status.monthly_limit
            ),
            _ => format!(
                "{} has used {:.0}% of its monthly budget (${:.2} of ${:.2})",
                status.user_id,
                fraction_used * 100.0,
                status.current_usage,
                status.monthly_limit
            ),
        };

        Some(CostAlert {
            user_id: status.user_id.clone(),
            severity,
            threshold,
            current_value: fraction_used,
            message,
            timestamp: now,
        })
    }

    /// Pre-flight budget check for a request that would cost
    /// `estimated_cost`, used by the pipeline to decide whether to
    /// downgrade to a cheaper model before dispatching.
    pub async fn check(&self, user_id: &str, tier: UserTier, estimated_cost: f64) -> Result<BudgetCheck> {
        let now = Utc::now();
        let monthly_limit = self.config.monthly_limit(tier);
        let current_usage = self.store.cost_since(user_id, month_start(now))?;
        let remaining_budget = (monthly_limit - current_usage).max(0.0);
        let after_request_usage = current_usage + estimated_cost;
        let would_exceed = after_request_usage > monthly_limit;
        let remaining_requests_at_this_cost = if estimated_cost > 0.0 {
            (remaining_budget / estimated_cost).floor() as u64
        } else {
            0
        };
        let percentage_used = if monthly_limit > 0.0 {
            current_usage / monthly_limit * 100.0
        } else {
            0.0
        };

        Ok(BudgetCheck {
            can_proceed: !would_exceed,
            current_usage,
            monthly_limit,
            remaining_budget,
            estimated_cost,
            after_request_usage,
            remaining_requests_at_this_cost,
            percentage_used,
            would_exceed,
        })
    }

    /// Aggregate usage over the trailing `days` days, for dashboards and
    /// the cost-optimisation recommendations below.
    pub async fn usage_summary(&self, user_id: &str, days: u32) -> Result<UsageSummary> {
        let since = Utc::now() - Duration::days(days as i64);
        let records = self.store.records_since(user_id, since)?;

        let total_cost: f64 = records.iter().map(|r| r.cost).sum();
        let total_requests = records.len() as u64;
        let avg_cost_per_request = if total_requests > 0 {
            total_cost / total_requests as f64
        } else {
            0.0
        };

        let mut model_breakdown: HashMap<String, f64> = HashMap::new();
        let mut task_breakdown: HashMap<String, f64> = HashMap::new();
        for record in &records {
            *model_breakdown.entry(record.model.clone()).or_insert(0.0) += record.cost;
            *task_breakdown.entry(record.task_kind.clone()).or_insert(0.0) += record.cost;
        }

        let daily_trend = self.store.daily_costs(user_id, days)?;

        Ok(UsageSummary {
            total_cost,
            total_requests,
            avg_cost_per_request,
            model_breakdown,
            task_breakdown,
            daily_trend,
        })
    }

    /// Flags expensive models that dominate a user's spend and could be
    /// swapped for a cheaper catalogue entry on similar work.
    pub async fn optimization_recommendations(&self, user_id: &str) -> Result<Vec<String>> {
        const EXPENSIVE_MODELS: &[&str] = &["gpt-4-turbo", "claude-3.5-sonnet"];
        let summary = self.usage_summary(user_id, 30).await?;
        if summary.total_cost <= 0.0 {
            return Ok(Vec::new());
        }

        let mut recommendations = Vec::new();
        for model in EXPENSIVE_MODELS {
            if let Some(&model_cost) = summary.model_breakdown.get(*model) {
                if model_cost / summary.total_cost > 0.30 {
                    recommendations.push(format!(
                        "{model} accounts for {:.0}% of recent spend; a cheaper catalogue model on similar tasks could save roughly 80% of that cost",
                        model_cost / summary.total_cost * 100.0
                    ));
                }
            }
        }
        Ok(recommendations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;
    use crate::store::SqliteUsageStore;

    fn tracker() -> CostTracker {
        CostTracker::new(
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(SqliteUsageStore::in_memory().unwrap()),
            Arc::new(BrokerConfig::default()),
        )
    }

    #[tokio::test]
    async fn status_starts_at_zero_usage() {
        let tracker = tracker();
        let status = tracker.status("u1", UserTier::Free).await.unwrap();
        assert_eq!(status.current_usage, 0.0);
        assert_eq!(status.monthly_limit, 1.00);
        assert_eq!(status.remaining_budget, 1.00);
        assert!(status.projected_overage.is_none());
    }

    #[tokio::test]
    async fn track_records_cost_and_updates_status() {
        let tracker = tracker();
        tracker
            .track("u1", UserTier::Creator, "deepseek-v3", "code_generation", 1.0, 100, 200)
            .await
            .unwrap();
        let status = tracker.status("u1", UserTier::Creator).await.unwrap();
        assert_eq!(status.current_usage, 1.0);
    }

    #[tokio::test]
    async fn exceeding_budget_produces_exceeded_alert() {
        let tracker = tracker();
        let alert = tracker
            .track("u1", UserTier::Free, "gpt-4-turbo", "analysis", 1.50, 500, 500)
            .await
            .unwrap();
        let alert = alert.expect("should alert once over budget");
        assert!(matches!(alert.severity, AlertSeverity::Exceeded));
    }

    #[tokio::test]
    async fn warning_threshold_fires_before_exceeded() {
        let tracker = tracker();
        let alert = tracker
            .track("u1", UserTier::Free, "deepseek-v3", "code_generation", 0.80, 100, 100)
            .await
            .unwrap()
            .expect("should alert at 80% of budget");
        assert!(matches!(alert.severity, AlertSeverity::Warning));
    }

    #[tokio::test]
    async fn budget_check_blocks_requests_that_would_exceed_limit() {
        let tracker = tracker();
        tracker
            .track("u1", UserTier::Free, "deepseek-v3", "code_generation", 0.90, 100, 100)
            .await
            .unwrap();
        let check = tracker.check("u1", UserTier::Free, 0.50).await.unwrap();
        assert!(!check.can_proceed);
        assert!(check.would_exceed);
    }

    #[tokio::test]
    async fn budget_check_allows_requests_within_remaining_budget() {
        let tracker = tracker();
        let check = tracker.check("u1", UserTier::Creator, 1.0).await.unwrap();
        assert!(check.can_proceed);
        assert_eq!(check.remaining_requests_at_this_cost, 8);
    }

    #[tokio::test]
    async fn usage_summary_breaks_down_by_model_and_task() {
        let tracker = tracker();
        tracker
            .track("u1", UserTier::Business, "gemini-1.5-pro", "analysis", 0.50, 100, 100)
            .await
            .unwrap();
        tracker
            .track("u1", UserTier::Business, "gemini-1.5-pro", "analysis", 0.25, 50, 50)
            .await
            .unwrap();
        let summary = tracker.usage_summary("u1", 30).await.unwrap();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.model_breakdown.get("gemini-1.5-pro"), Some(&0.75));
        assert_eq!(summary.task_breakdown.get("analysis"), Some(&0.75));
    }
}
