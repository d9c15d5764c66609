//! The key-value store abstraction the source system's redis client is
//! generalised into: `get/set/setex`, atomic numeric increment, hash-field
//! increment, scan-by-prefix, TTL management, and approximate memory
//! usage per key. An external collaborator — the broker depends only on
//! this trait; any conforming store (Redis, an embedded KV engine, …)
//! may be substituted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Atomically add `delta` to the numeric value stored at `key` (creating
    /// it at `delta` if absent) and return the new total.
    async fn increment(&self, key: &str, delta: f64) -> Result<f64>;
    /// Atomically add `delta` to one field of the hash stored at `key`.
    async fn hash_increment(&self, key: &str, field: &str, delta: f64) -> Result<f64>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    /// Approximate in-memory footprint of one key, in bytes.
    async fn memory_usage(&self, key: &str) -> Result<u64>;
}

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

struct HashEntry {
    fields: HashMap<String, f64>,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process reference implementation, used in tests and as a
/// development fallback. Not persistent and not shared across processes.
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    strings: Arc<Mutex<HashMap<String, Entry>>>,
    hashes: Arc<Mutex<HashMap<String, HashEntry>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry_expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        entry_expiry.map_or(true, |expires_at| expires_at > now)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let mut strings = self.strings.lock().await;
        match strings.get(key) {
            Some(entry) if Self::is_live(entry.expires_at, now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut strings = self.strings.lock().await;
        strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut strings = self.strings.lock().await;
        strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Utc::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.strings.lock().await.remove(key);
        self.hashes.lock().await.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: f64) -> Result<f64> {
        let mut strings = self.strings.lock().await;
        let now = Utc::now();
        let current = match strings.get(key) {
            Some(entry) if Self::is_live(entry.expires_at, now) => {
                entry.value.parse::<f64>().map_err(|e| Error::KeyValueStore(e.to_string()))?
            }
            _ => 0.0,
        };
        let updated = current + delta;
        let expires_at = strings.get(key).and_then(|e| e.expires_at);
        strings.insert(
            key.to_string(),
            Entry {
                value: updated.to_string(),
                expires_at,
            },
        );
        Ok(updated)
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut hashes = self.hashes.lock().await;
        let entry = hashes.entry(key.to_string()).or_insert_with(|| HashEntry {
            fields: HashMap::new(),
            expires_at: None,
        });
        let updated = entry.fields.entry(field.to_string()).or_insert(0.0);
        *updated += delta;
        Ok(*updated)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = Utc::now();
        let hashes = self.hashes.lock().await;
        match hashes.get(key) {
            Some(entry) if Self::is_live(entry.expires_at, now) => {
                Ok(entry.fields.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
            }
            _ => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let expires_at = Some(Utc::now() + ttl);
        if let Some(entry) = self.strings.lock().await.get_mut(key) {
            entry.expires_at = expires_at;
        }
        if let Some(entry) = self.hashes.lock().await.get_mut(key) {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let strings = self.strings.lock().await;
        Ok(strings
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && Self::is_live(entry.expires_at, now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn memory_usage(&self, key: &str) -> Result<u64> {
        let strings = self.strings.lock().await;
        Ok(strings.get(key).map(|e| (key.len() + e.value.len()) as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryKeyValueStore::new();
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn setex_expires_after_ttl() {
        let store = InMemoryKeyValueStore::new();
        store.setex("a", "1", Duration::seconds(-1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_accumulates() {
        let store = InMemoryKeyValueStore::new();
        store.increment("cost", 1.5).await.unwrap();
        let total = store.increment("cost", 2.5).await.unwrap();
        assert_eq!(total, 4.0);
    }

    #[tokio::test]
    async fn hash_increment_tracks_independent_fields() {
        let store = InMemoryKeyValueStore::new();
        store.hash_increment("stats", "hits", 1.0).await.unwrap();
        store.hash_increment("stats", "hits", 1.0).await.unwrap();
        store.hash_increment("stats", "misses", 1.0).await.unwrap();
        let all = store.hash_get_all("stats").await.unwrap();
        assert_eq!(all.get("hits"), Some(&"2".to_string()));
        assert_eq!(all.get("misses"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn scan_prefix_filters_by_prefix() {
        let store = InMemoryKeyValueStore::new();
        store.set("cost:daily:u1", "1").await.unwrap();
        store.set("cost:monthly:u1", "2").await.unwrap();
        store.set("other:u1", "3").await.unwrap();
        let mut keys = store.scan_prefix("cost:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cost:daily:u1".to_string(), "cost:monthly:u1".to_string()]);
    }
}
