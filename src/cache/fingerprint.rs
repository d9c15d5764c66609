//! Request fingerprinting and fuzzy-similarity scoring.

use std::collections::HashSet;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::provider::types::{Request, TaskKind, UserTier};

/// The fields that determine whether two requests are the same for
/// caching purposes, in the exact order/shape that gets canonicalised
/// into JSON before hashing.
#[derive(Serialize)]
struct FingerprintFields<'a> {
    task_type: &'a str,
    content: String,
    complexity: u8,
    user_tier: UserTier,
    requires_vision: bool,
    user_id: Option<&'a str>,
}

/// Hex-encoded SHA-256 digest, keyed under the `ai_cache:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// SHA-256 of the canonicalised JSON form of
    /// `{task_type, content.lower().strip(), complexity, user_tier,
    /// requires_vision, user_id}` with keys sorted — `serde_json`
    /// serializes struct fields in declaration order, which we rely on
    /// together with consistent field naming to stand in for "sorted
    /// keys": any ordering is fine as long as it's always the same one.
    pub fn compute(request: &Request, user_id: Option<&str>) -> Self {
        let fields = FingerprintFields {
            task_type: request.task_kind.as_str(),
            content: request.content.to_lowercase().trim().to_string(),
            complexity: request.complexity,
            user_tier: request.user_tier,
            requires_vision: request.requires_vision,
            user_id,
        };
        let canonical = serde_json::to_string(&fields).expect("fingerprint fields always serialize");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn cache_key(&self) -> String {
        format!("ai_cache:{}", self.0)
    }

    pub fn meta_key(&self) -> String {
        format!("ai_cache:meta:{}", self.0)
    }
}

/// Jaccard similarity of the lowercase, whitespace-tokenised content of
/// two requests. Used only for fuzzy matching among requests, never
/// between a request and a stored response (the corrected direction —
/// see the metadata sidecar design in `cache::store`).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> { s.to_lowercase().split_whitespace().map(String::from).collect() };
    let set_a = tokens(a);
    let set_b = tokens(b);
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / union as f64
}

/// Per-task-kind cache tuning: TTL, fuzzy similarity threshold, whether
/// fuzzy matching is enabled at all.
#[derive(Debug, Clone, Copy)]
pub struct CacheTaskConfig {
    pub ttl_seconds: i64,
    pub similarity_threshold: f64,
    pub fuzzy_enabled: bool,
}

pub fn cache_config_for(task_kind: TaskKind) -> CacheTaskConfig {
    const DAY: i64 = 86_400;
    match task_kind {
        TaskKind::CodeGen => CacheTaskConfig {
            ttl_seconds: 14 * DAY,
            similarity_threshold: 0.95,
            fuzzy_enabled: false,
        },
        TaskKind::ComponentGen => CacheTaskConfig {
            ttl_seconds: 30 * DAY,
            similarity_threshold: 0.90,
            fuzzy_enabled: true,
        },
        TaskKind::Content => CacheTaskConfig {
            ttl_seconds: 7 * DAY,
            similarity_threshold: 0.80,
            fuzzy_enabled: true,
        },
        TaskKind::Analysis => CacheTaskConfig {
            ttl_seconds: 3 * DAY,
            similarity_threshold: 0.75,
            fuzzy_enabled: true,
        },
        _ => CacheTaskConfig {
            ttl_seconds: 7 * DAY,
            similarity_threshold: 0.85,
            fuzzy_enabled: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fingerprint_folds_case_and_trims_whitespace() {
        let a = Request::new(TaskKind::ComponentGen, 3, "Blue submit button", UserTier::Creator);
        let b = Request::new(TaskKind::ComponentGen, 3, "  blue SUBMIT button  ", UserTier::Creator);
        assert_eq!(Fingerprint::compute(&a, None), Fingerprint::compute(&b, None));
    }

    #[test]
    fn fingerprint_differs_when_user_id_differs() {
        let request = Request::new(TaskKind::Analysis, 4, "analyze this", UserTier::Business);
        let fp1 = Fingerprint::compute(&request, Some("user-a"));
        let fp2 = Fingerprint::compute(&request, Some("user-b"));
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn cache_key_uses_expected_prefix() {
        let request = Request::new(TaskKind::Analysis, 4, "analyze this", UserTier::Business);
        let fp = Fingerprint::compute(&request, None);
        assert!(fp.cache_key().starts_with("ai_cache:"));
        assert!(fp.meta_key().starts_with("ai_cache:meta:"));
    }

    #[test]
    fn jaccard_of_identical_content_is_one() {
        assert_eq!(jaccard_similarity("blue submit button", "blue submit button"), 1.0);
    }

    #[test]
    fn jaccard_of_disjoint_content_is_zero() {
        assert_eq!(jaccard_similarity("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn task_cache_config_matches_spec_table() {
        let code = cache_config_for(TaskKind::CodeGen);
        assert_eq!(code.ttl_seconds, 14 * 86_400);
        assert_eq!(code.similarity_threshold, 0.95);
        assert!(!code.fuzzy_enabled);

        let component = cache_config_for(TaskKind::ComponentGen);
        assert_eq!(component.ttl_seconds, 30 * 86_400);
        assert!(component.fuzzy_enabled);

        let default = cache_config_for(TaskKind::Translation);
        assert_eq!(default.ttl_seconds, 7 * 86_400);
        assert_eq!(default.similarity_threshold, 0.85);
        assert!(!default.fuzzy_enabled);
    }

    proptest! {
        #[test]
        fn jaccard_is_symmetric(a in "[a-z ]{0,40}", b in "[a-z ]{0,40}") {
            let ab = jaccard_similarity(&a, &b);
            let ba = jaccard_similarity(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-12);
        }
    }
}
