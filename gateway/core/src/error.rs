//! Gateway Error Taxonomy
//!
//! Every fallible operation in the crate returns [`GatewayError`]. The enum is
//! `Clone` so a single failure can be handed to every caller that was
//! coalesced onto the same in-flight fetch.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the admission, routing, caching and billing layers
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// A channel, cache key or user record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed channel, pricing or runtime configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or timeout failure that may succeed on retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// The user's remaining quota cannot cover the requested debit
    #[error("quota exhausted for user {user_id}: remaining {remaining}, required {required}")]
    QuotaExhausted {
        /// User whose quota is exhausted
        user_id: i64,
        /// Remaining quota at the time of the check
        remaining: i64,
        /// Amount that was requested
        required: i64,
    },

    /// A bounded queue rejected an item
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Expected cache miss; never shown to end users
    #[error("cache miss: {0}")]
    CacheMiss(String),

    /// Token bucket is empty for this key
    #[error("too many requests for {key}, retry after {retry_after:?}")]
    RateLimited {
        /// Bucket key that was throttled
        key: String,
        /// Time until one token is available again
        retry_after: Duration,
    },

    /// The user or token is disabled or expired
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Every selection attempt failed or no candidates remained
    #[error("all {attempts} attempt(s) for model {model} failed: {}", errors.join("; "))]
    RetriesExhausted {
        /// Requested model
        model: String,
        /// Number of attempts made
        attempts: u32,
        /// Error message of each failed attempt, in order
        errors: Vec<String>,
    },

    /// The operation was cancelled before completing
    #[error("operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether retrying the same operation could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this is a not-found style signal rather than a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::CacheMiss(_))
    }

    /// Convenience constructor for timeouts on backing-store calls
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::Transient(format!("{operation} timed out after {after:?}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("serialization: {err}"))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GatewayError>;
