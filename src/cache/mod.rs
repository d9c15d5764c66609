//! Fingerprint cache: deduplicates requests (exact and fuzzy) with
//! TTL-based expiry and adaptive extension.

mod fingerprint;
mod store;

pub use fingerprint::{cache_config_for, jaccard_similarity, CacheTaskConfig, Fingerprint};
pub use store::{CacheEntry, FingerprintCache, OptimiseReport, Statistics};
