//! Error types for the broker.

use thiserror::Error;

/// Result type alias using the broker's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the broker's core.
#[derive(Error, Debug)]
pub enum Error {
    /// Provider rejected the request's credentials. Fatal, no retry.
    #[error("invalid credentials for provider {provider}")]
    InvalidCredentials { provider: String },

    /// Provider rate limit hit. Surfaced with the provider's retry hint; the
    /// pipeline never auto-retries this itself.
    #[error("rate limited by {provider}, retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    /// Provider rejected the request body as malformed.
    #[error("bad request to {provider}: {detail}")]
    BadRequest { provider: String, detail: String },

    /// Transport-level failure. Eligible for the pipeline's fallback path.
    #[error("network error talking to {provider}: {message}")]
    NetworkError { provider: String, message: String },

    /// The call did not complete within its configured timeout. Eligible
    /// for the pipeline's fallback path.
    #[error("timed out after {duration_ms}ms talking to {provider}")]
    Timeout { provider: String, duration_ms: u64 },

    /// The provider's response could not be parsed into the expected shape.
    #[error("protocol error from {provider}: {message}")]
    ProtocolError { provider: String, message: String },

    /// No selection, including the cheaper-model downgrade, fit the
    /// caller's remaining budget.
    #[error("insufficient budget: need ${need:.4}, have ${have:.4}")]
    InsufficientBudget { need: f64, have: f64 },

    /// A cache entry failed to deserialize. Never surfaced to a caller; the
    /// entry is dropped and the lookup is treated as a miss.
    #[error("cache entry corrupt: {0}")]
    CacheCorrupt(String),

    /// The key-value store (rate counters, cache, cost counters) failed.
    #[error("key-value store error: {0}")]
    KeyValueStore(String),

    /// The durable usage-record store failed.
    #[error("durable store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error, e.g. a missing required provider API key.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation; should not occur in correct operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_credentials(provider: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            provider: provider.into(),
        }
    }

    pub fn rate_limited(provider: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            retry_after_secs,
        }
    }

    pub fn bad_request(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BadRequest {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            provider: provider.into(),
            duration_ms,
        }
    }

    pub fn protocol(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProtocolError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn insufficient_budget(need: f64, have: f64) -> Self {
        Self::InsufficientBudget { need, have }
    }

    /// True for the error kinds the pipeline may recover from via the
    /// fallback path (network failures and timeouts only).
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::Timeout { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let provider = "http".to_string();
        if err.is_timeout() {
            Self::Timeout {
                provider,
                duration_ms: 0,
            }
        } else if err.is_connect() || err.is_request() {
            Self::NetworkError {
                provider,
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Self::ProtocolError {
                provider,
                message: err.to_string(),
            }
        } else {
            Self::NetworkError {
                provider,
                message: err.to_string(),
            }
        }
    }
}
