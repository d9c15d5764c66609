//! Fingerprint cache: deduplicates requests (exact and fuzzy), with
//! TTL-based expiry, adaptive TTL extension on hit, and per-scope
//! statistics. Backed by the key-value store abstraction (§6.2/§9) —
//! every entry, its metadata sidecar, and the stats counters live under
//! the `ai_cache:`/`ai_cache_stats:` key prefixes so a real deployment can
//! point this at shared Redis-like storage instead of process memory.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::fingerprint::{cache_config_for, jaccard_similarity, Fingerprint};
use crate::kv::KeyValueStore;
use crate::provider::types::{Request, Response, TaskKind, UserTier};

const THIRTY_DAYS_SECONDS: i64 = 30 * 86_400;
const STATS_TTL: Duration = Duration::days(30);
const GLOBAL_SCOPE: &str = "global";
const META_PREFIX: &str = "ai_cache:meta:";
const ENTRY_PREFIX: &str = "ai_cache:";
const STATS_PREFIX: &str = "ai_cache_stats:";

/// A cached response plus the bookkeeping the cache needs to expire and
/// evict it. Serialized verbatim into the `ai_cache:<fingerprint>` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: Response,
    pub cached_at: DateTime<Utc>,
    pub hit_count: u64,
    pub cost_saved: f64,
    pub original_cost: f64,
    pub similarity_threshold: f64,
    pub ttl_seconds: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.cached_at > Duration::seconds(self.ttl_seconds)
    }
}

/// Sidecar stored alongside every `CacheEntry` at `ai_cache:meta:<fp>`,
/// carrying the fields fuzzy matching and scoped invalidation need.
/// Storing the original request's content here (not just its length) is
/// what makes fuzzy matching compare request-to-request instead of
/// request-to-response.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataSidecar {
    task_kind: TaskKind,
    #[allow(dead_code)]
    complexity: u8,
    user_id: Option<String>,
    content: String,
    #[allow(dead_code)]
    requires_vision: bool,
    created_at: DateTime<Utc>,
}

/// Per-scope (global or per-user) running counters, mirrored onto the
/// hash at `ai_cache_stats:<scope>` with atomic field increments.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_cost_saved: f64,
    pub storage_bytes: u64,
}

impl Statistics {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64 * 100.0
        }
    }

    fn from_hash(fields: &std::collections::HashMap<String, String>) -> Self {
        let get = |field: &str| fields.get(field).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        Self {
            total_requests: get("total_requests") as u64,
            cache_hits: get("cache_hits") as u64,
            cache_misses: get("cache_misses") as u64,
            total_cost_saved: get("total_cost_saved"),
            storage_bytes: get("storage_bytes") as u64,
        }
    }
}

/// Result of an `optimise()` sweep.
#[derive(Debug, Clone, Default)]
pub struct OptimiseReport {
    pub removed_expired: u64,
    pub removed_unused: u64,
    pub compression_candidates: u64,
    pub total_processed: u64,
}

/// Deduplicates requests by fingerprint (exact) and, where enabled for
/// the task kind, by Jaccard similarity against recent entries (fuzzy).
/// All persisted state lives in the injected `KeyValueStore`; this type
/// holds no storage of its own beyond the quality floor it was built
/// with.
pub struct FingerprintCache {
    kv: Arc<dyn KeyValueStore>,
    quality_floor: f64,
}

impl FingerprintCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, quality_floor: f64) -> Self {
        Self { kv, quality_floor }
    }

    /// §4.D `lookup(request, user_id) -> Response?`.
    pub async fn lookup(&self, request: &Request, user_id: Option<&str>) -> Option<Response> {
        let fingerprint = Fingerprint::compute(request, user_id);
        let now = Utc::now();

        if let Some(entry) = self.read_entry(&fingerprint, now).await {
            self.record_hit(&fingerprint, &entry, user_id).await;
            tracing::debug!(fingerprint = %fingerprint.0, "cache hit (exact)");
            return Some(entry.response);
        }

        let config = cache_config_for(request.task_kind);
        if config.fuzzy_enabled {
            if let Some((fp, entry)) = self.fuzzy_lookup(request, user_id, config.similarity_threshold, now).await {
                self.record_hit(&fp, &entry, user_id).await;
                tracing::debug!(fingerprint = %fp.0, "cache hit (fuzzy)");
                return Some(entry.response);
            }
        }

        self.record_miss(user_id).await;
        None
    }

    /// Reads and deserializes the entry at `fingerprint`'s key, treating
    /// a deserialization failure as `CacheCorrupt`: the entry is deleted
    /// and the read is silently treated as a miss, per §7.
    async fn read_entry(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<CacheEntry> {
        let raw = self.kv.get(&fingerprint.cache_key()).await.ok().flatten()?;
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if !entry.is_expired(now) => Some(entry),
            Ok(_) => {
                self.delete_entry(fingerprint).await;
                None
            }
            Err(err) => {
                tracing::warn!(fingerprint = %fingerprint.0, error = %err, "cache entry corrupt, dropping");
                self.delete_entry(fingerprint).await;
                None
            }
        }
    }

    async fn delete_entry(&self, fingerprint: &Fingerprint) {
        let _ = self.kv.delete(&fingerprint.cache_key()).await;
        let _ = self.kv.delete(&fingerprint.meta_key()).await;
    }

    async fn fuzzy_lookup(
        &self,
        request: &Request,
        user_id: Option<&str>,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<(Fingerprint, CacheEntry)> {
        let meta_keys = self.kv.scan_prefix(META_PREFIX).await.ok()?;

        let mut best: Option<(Fingerprint, CacheEntry, f64, DateTime<Utc>)> = None;

        for meta_key in meta_keys {
            let fp_hex = meta_key.strip_prefix(META_PREFIX)?.to_string();
            let fingerprint = Fingerprint(fp_hex);

            let Some(raw_meta) = self.kv.get(&meta_key).await.ok().flatten() else { continue };
            let meta: MetadataSidecar = match serde_json::from_str(&raw_meta) {
                Ok(meta) => meta,
                Err(_) => {
                    // Corrupt sidecar: drop both halves and keep scanning.
                    self.delete_entry(&fingerprint).await;
                    continue;
                }
            };
            if meta.task_kind != request.task_kind {
                continue;
            }
            if let (Some(requested), Some(stored)) = (user_id, meta.user_id.as_deref()) {
                if requested != stored {
                    continue;
                }
            }

            let Some(entry) = self.read_entry(&fingerprint, now).await else {
                continue;
            };

            let similarity = jaccard_similarity(&request.content, &meta.content);
            if similarity < threshold {
                continue;
            }

            let is_better = match &best {
                None => true,
                Some((_, _, best_similarity, best_created_at)) => {
                    similarity > *best_similarity
                        || (similarity == *best_similarity && meta.created_at > *best_created_at)
                }
            };
            if is_better {
                best = Some((fingerprint, entry, similarity, meta.created_at));
            }
        }

        best.map(|(fp, entry, ..)| (fp, entry))
    }

    /// §4.D `store(request, response, user_id) -> bool`, only when
    /// `response.quality_score > cache_quality_floor`.
    pub async fn store(&self, request: &Request, response: &Response, user_id: Option<&str>) -> bool {
        let Some(quality) = response.quality_score else {
            return false;
        };
        if quality <= self.quality_floor {
            return false;
        }

        let fingerprint = Fingerprint::compute(request, user_id);
        let config = cache_config_for(request.task_kind);

        let entry = CacheEntry {
            fingerprint: fingerprint.0.clone(),
            response: response.clone(),
            cached_at: Utc::now(),
            hit_count: 0,
            cost_saved: 0.0,
            original_cost: response.cost,
            similarity_threshold: config.similarity_threshold,
            ttl_seconds: config.ttl_seconds,
        };
        let meta = MetadataSidecar {
            task_kind: request.task_kind,
            complexity: request.complexity,
            user_id: user_id.map(String::from),
            content: request.content.clone(),
            requires_vision: request.requires_vision,
            created_at: Utc::now(),
        };

        let Ok(entry_json) = serde_json::to_string(&entry) else { return false };
        let Ok(meta_json) = serde_json::to_string(&meta) else { return false };
        let ttl = Duration::seconds(config.ttl_seconds);

        if self.kv.setex(&fingerprint.cache_key(), &entry_json, ttl).await.is_err() {
            return false;
        }
        let _ = self.kv.setex(&fingerprint.meta_key(), &meta_json, ttl).await;
        true
    }

    async fn record_hit(&self, fingerprint: &Fingerprint, entry: &CacheEntry, user_id: Option<&str>) {
        let mut updated = entry.clone();
        updated.hit_count += 1;
        updated.cost_saved += updated.original_cost;
        updated.ttl_seconds = (updated.ttl_seconds * 2).min(THIRTY_DAYS_SECONDS);

        if let Ok(json) = serde_json::to_string(&updated) {
            let ttl = Duration::seconds(updated.ttl_seconds);
            let _ = self.kv.setex(&fingerprint.cache_key(), &json, ttl).await;
            let _ = self.kv.expire(&fingerprint.meta_key(), ttl).await;
        }

        self.bump_stats(user_id, &[
            ("total_requests", 1.0),
            ("cache_hits", 1.0),
            ("total_cost_saved", entry.original_cost),
        ])
        .await;
    }

    async fn record_miss(&self, user_id: Option<&str>) {
        self.bump_stats(user_id, &[("total_requests", 1.0), ("cache_misses", 1.0)]).await;
    }

    async fn bump_stats(&self, user_id: Option<&str>, deltas: &[(&str, f64)]) {
        for scope in [Some(GLOBAL_SCOPE), user_id] {
            let Some(scope) = scope else { continue };
            let key = format!("{STATS_PREFIX}{scope}");
            for (field, delta) in deltas {
                let _ = self.kv.hash_increment(&key, field, *delta).await;
            }
            let _ = self.kv.expire(&key, STATS_TTL).await;
        }
    }

    /// §4.D `invalidate(user_id?, task_kind?) -> n`. Entries whose
    /// sidecar fails to parse (or is missing) are treated as corrupt and
    /// always removed, counting toward the total.
    pub async fn invalidate(&self, user_id: Option<&str>, task_kind: Option<TaskKind>) -> usize {
        let entry_keys = self.kv.scan_prefix(ENTRY_PREFIX).await.unwrap_or_default();
        let mut removed = 0usize;

        for key in entry_keys {
            // `scan_prefix(ENTRY_PREFIX)` also matches meta keys since
            // `ai_cache:meta:` shares the `ai_cache:` prefix; skip them,
            // they are removed alongside their entry below.
            if key.starts_with(META_PREFIX) {
                continue;
            }
            let Some(fp_hex) = key.strip_prefix(ENTRY_PREFIX) else { continue };
            let fingerprint = Fingerprint(fp_hex.to_string());
            let meta_key = fingerprint.meta_key();

            let matches = match self.kv.get(&meta_key).await.ok().flatten() {
                Some(raw) => match serde_json::from_str::<MetadataSidecar>(&raw) {
                    Ok(meta) => {
                        let user_matches = user_id.map_or(true, |u| meta.user_id.as_deref() == Some(u));
                        let task_matches = task_kind.map_or(true, |t| meta.task_kind == t);
                        user_matches && task_matches
                    }
                    Err(_) => true,
                },
                None => true,
            };
            if matches {
                self.delete_entry(&fingerprint).await;
                removed += 1;
            }
        }
        tracing::info!(removed, "invalidated cache entries");
        removed
    }

    /// §4.D `optimise()`: sweep all entries, delete expired and
    /// never-hit-after-24h entries, and count oversized entries as
    /// compression candidates without actually compressing them.
    pub async fn optimise(&self) -> OptimiseReport {
        let now = Utc::now();
        let entry_keys = self.kv.scan_prefix(ENTRY_PREFIX).await.unwrap_or_default();
        let mut report = OptimiseReport::default();

        for key in entry_keys {
            if key.starts_with(META_PREFIX) {
                continue;
            }
            let Some(fp_hex) = key.strip_prefix(ENTRY_PREFIX) else { continue };
            let fingerprint = Fingerprint(fp_hex.to_string());

            let Some(raw) = self.kv.get(&key).await.ok().flatten() else { continue };
            let entry: CacheEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(_) => {
                    self.delete_entry(&fingerprint).await;
                    continue;
                }
            };
            report.total_processed += 1;

            if entry.is_expired(now) {
                self.delete_entry(&fingerprint).await;
                report.removed_expired += 1;
            } else if entry.hit_count == 0 && (now - entry.cached_at) > Duration::hours(24) {
                self.delete_entry(&fingerprint).await;
                report.removed_unused += 1;
            } else {
                let approx_size = raw.len() + fingerprint.0.len();
                if approx_size > 10 * 1024 {
                    report.compression_candidates += 1;
                }
            }
        }
        report
    }

    pub async fn stats(&self, scope: Option<&str>) -> Statistics {
        let key = format!("{STATS_PREFIX}{}", scope.unwrap_or(GLOBAL_SCOPE));
        let fields = self.kv.hash_get_all(&key).await.unwrap_or_default();
        Statistics::from_hash(&fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;
    use crate::provider::types::Request;

    fn cache(quality_floor: f64) -> FingerprintCache {
        FingerprintCache::new(Arc::new(InMemoryKeyValueStore::new()), quality_floor)
    }

    fn response(content: &str, quality: f64) -> Response {
        Response {
            content: content.to_string(),
            model: "deepseek-v3".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            cost: 0.01,
            quality_score: Some(quality),
            processing_time_secs: 0.5,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips_above_quality_floor() {
        let cache = cache(0.7);
        let request = Request::new(TaskKind::ComponentGen, 3, "blue submit button", UserTier::Creator)
            .with_user_id("u1");
        let resp = response("<button>Submit</button>", 0.9);

        assert!(cache.store(&request, &resp, Some("u1")).await);
        let found = cache.lookup(&request, Some("u1")).await;
        assert_eq!(found.unwrap().content, resp.content);
    }

    #[tokio::test]
    async fn store_is_rejected_below_quality_floor() {
        let cache = cache(0.7);
        let request = Request::new(TaskKind::ComponentGen, 3, "blue submit button", UserTier::Creator);
        let resp = response("weak answer", 0.5);

        assert!(!cache.store(&request, &resp, None).await);
        assert!(cache.lookup(&request, None).await.is_none());
    }

    #[tokio::test]
    async fn fuzzy_match_compares_against_stored_request_not_stored_response() {
        let cache = cache(0.7);
        let stored_request =
            Request::new(TaskKind::Content, 3, "blue submit button design", UserTier::Creator);
        let resp = response("a response whose words share nothing with the query", 0.9);
        assert!(cache.store(&stored_request, &resp, None).await);

        // Jaccard of the two *requests* is 4/5 = 0.8, clearing Content's 0.80
        // threshold, even though the stored response shares no words at all
        // with the new request — proof the comparison is request-to-request.
        let similar_request =
            Request::new(TaskKind::Content, 3, "blue submit button design review", UserTier::Creator);
        let found = cache.lookup(&similar_request, None).await;
        assert!(found.is_some(), "fuzzy match should fire on request-to-request similarity");
    }

    #[tokio::test]
    async fn invalidate_respects_user_scoping() {
        let cache = cache(0.7);
        let request_a =
            Request::new(TaskKind::Analysis, 4, "analyze this report", UserTier::Business).with_user_id("a");
        let request_b =
            Request::new(TaskKind::Analysis, 4, "analyze this other report", UserTier::Business).with_user_id("b");
        cache.store(&request_a, &response("x", 0.9), Some("a")).await;
        cache.store(&request_b, &response("y", 0.9), Some("b")).await;

        let removed = cache.invalidate(Some("a"), None).await;
        assert_eq!(removed, 1);
        assert!(cache.lookup(&request_a, Some("a")).await.is_none());
        assert!(cache.lookup(&request_b, Some("b")).await.is_some());
    }

    #[tokio::test]
    async fn hit_recording_doubles_ttl_capped_at_thirty_days() {
        let cache = cache(0.7);
        let request = Request::new(TaskKind::CodeGen, 4, "write a sort function", UserTier::Business);
        cache.store(&request, &response("fn sort() {}", 0.9), None).await;

        cache.lookup(&request, None).await;
        let fingerprint = Fingerprint::compute(&request, None);
        let raw = cache.kv.get(&fingerprint.cache_key()).await.unwrap().unwrap();
        let entry: CacheEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.ttl_seconds, 14 * 86_400 * 2);
    }

    #[tokio::test]
    async fn optimise_removes_expired_entries() {
        let cache = cache(0.7);
        let request = Request::new(TaskKind::Analysis, 4, "analyze this", UserTier::Business);
        let resp = response("finding: it's fine", 0.9);
        let fingerprint = Fingerprint::compute(&request, None);

        let mut entry = CacheEntry {
            fingerprint: fingerprint.0.clone(),
            response: resp,
            cached_at: Utc::now() - Duration::days(10),
            hit_count: 0,
            cost_saved: 0.0,
            original_cost: 0.01,
            similarity_threshold: 0.75,
            ttl_seconds: 3 * 86_400,
        };
        entry.ttl_seconds = 3 * 86_400;
        let json = serde_json::to_string(&entry).unwrap();
        cache.kv.set(&fingerprint.cache_key(), &json).await.unwrap();

        let report = cache.optimise().await;
        assert_eq!(report.removed_expired, 1);
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let cache = cache(0.7);
        let request = Request::new(TaskKind::Analysis, 4, "analyze this", UserTier::Business);
        cache.lookup(&request, None).await;
        cache.store(&request, &response("finding: ok", 0.9), None).await;
        cache.lookup(&request, None).await;

        let stats = cache.stats(None).await;
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert!(stats.hit_rate() > 0.0);
    }
}
