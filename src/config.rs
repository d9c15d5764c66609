//! Broker-wide configuration: tier limits, alert thresholds, provider
//! endpoints, and the tunables that the cache and router read at
//! construction time.

use std::collections::HashMap;
use std::env;

use crate::provider::types::UserTier;

/// Severity thresholds for budget alerts, as fractions of the monthly limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
    pub exceeded: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.90,
            exceeded: 1.00,
        }
    }
}

/// Per-provider connection settings: base URL, API key, and call timeout.
#[derive(Debug, Clone, Default)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

/// Typed form of the enumerated configuration options.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub default_cache_ttl_seconds: i64,
    pub similarity_threshold_default: f64,
    pub tier_monthly_limits_usd: HashMap<UserTier, f64>,
    pub alert_thresholds: AlertThresholds,
    pub provider_endpoints: HashMap<String, ProviderEndpoint>,
    pub rate_limit_sleep_cap_seconds: u64,
    pub history_window: usize,
    pub cache_quality_floor: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let mut tier_monthly_limits_usd = HashMap::new();
        tier_monthly_limits_usd.insert(UserTier::Free, 1.00);
        tier_monthly_limits_usd.insert(UserTier::Creator, 8.82);
        tier_monthly_limits_usd.insert(UserTier::Business, 23.84);
        tier_monthly_limits_usd.insert(UserTier::Agency, 131.67);

        let mut provider_endpoints = HashMap::new();
        provider_endpoints.insert(
            "deepseek".to_string(),
            ProviderEndpoint {
                base_url: "https://api.deepseek.com/v1".to_string(),
                api_key: env::var("DEEPSEEK_API_KEY").ok(),
                request_timeout_secs: 60,
            },
        );
        provider_endpoints.insert(
            "gemini".to_string(),
            ProviderEndpoint {
                base_url: "https://generativelanguage.googleapis.com/v1".to_string(),
                api_key: env::var("GEMINI_API_KEY").ok(),
                request_timeout_secs: 60,
            },
        );
        provider_endpoints.insert(
            "claude".to_string(),
            ProviderEndpoint {
                base_url: "https://api.anthropic.com".to_string(),
                api_key: env::var("ANTHROPIC_API_KEY").ok(),
                request_timeout_secs: 60,
            },
        );
        provider_endpoints.insert(
            "openai".to_string(),
            ProviderEndpoint {
                base_url: "https://api.openai.com".to_string(),
                api_key: env::var("OPENAI_API_KEY").ok(),
                request_timeout_secs: 60,
            },
        );

        Self {
            default_cache_ttl_seconds: 604_800,
            similarity_threshold_default: 0.85,
            tier_monthly_limits_usd,
            alert_thresholds: AlertThresholds::default(),
            provider_endpoints,
            rate_limit_sleep_cap_seconds: 60,
            history_window: 1000,
            cache_quality_floor: 0.7,
        }
    }
}

impl BrokerConfig {
    pub fn monthly_limit(&self, tier: UserTier) -> f64 {
        self.tier_monthly_limits_usd
            .get(&tier)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn endpoint(&self, provider: &str) -> Option<&ProviderEndpoint> {
        self.provider_endpoints.get(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tier_limits_match_spec() {
        let config = BrokerConfig::default();
        assert_eq!(config.monthly_limit(UserTier::Free), 1.00);
        assert_eq!(config.monthly_limit(UserTier::Creator), 8.82);
        assert_eq!(config.monthly_limit(UserTier::Business), 23.84);
        assert_eq!(config.monthly_limit(UserTier::Agency), 131.67);
    }

    #[test]
    fn default_alert_thresholds_match_spec() {
        let thresholds = AlertThresholds::default();
        assert_eq!(thresholds.warning, 0.75);
        assert_eq!(thresholds.critical, 0.90);
        assert_eq!(thresholds.exceeded, 1.00);
    }
}
