//! Request Rate Limiting
//!
//! Per-key token bucket. The bucket lives in a [`BucketStore`] that applies
//! the refill-and-consume step atomically, so concurrent requests for the
//! same key (in this process or another one sharing Redis) never race.
//!
//! Keys prefer the authenticated user id and fall back to the client IP.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use gateway_core::rate_limit::{InMemoryBucketStore, RateLimitConfig, RateLimiter};
//!
//! let config = RateLimitConfig::new()
//!     .with_requests_per_second(5.0)
//!     .with_burst_size(10);
//! let limiter = RateLimiter::new(config, Arc::new(InMemoryBucketStore::new()));
//! ```

pub mod store;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use store::{
    BucketOutcome, BucketParams, BucketStore, Clock, InMemoryBucketStore, ManualClock,
    SystemClock, MILLI,
};
#[cfg(feature = "redis")]
pub use store::RedisBucketStore;

use crate::error::{GatewayError, Result};
use crate::metrics::Counter;
use crate::task::PeriodicTask;

// =============================================================================
// Configuration
// =============================================================================

/// Rate limiter settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state refill rate (tokens per second)
    pub requests_per_second: f64,

    /// Bucket capacity; the number of requests admitted back to back
    pub burst_size: u32,

    /// Whether to limit at all
    pub enabled: bool,

    /// Admit requests when the bucket store is unreachable
    pub fail_open: bool,

    /// Prefix for bucket keys in the store
    pub key_prefix: String,

    /// Bound on one store round trip (milliseconds)
    pub op_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20,
            enabled: true,
            fail_open: true,
            key_prefix: "rl:".to_string(),
            op_timeout_ms: 5_000,
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the refill rate
    #[must_use]
    pub fn with_requests_per_second(mut self, rate: f64) -> Self {
        self.requests_per_second = rate;
        self
    }

    /// Set the burst size
    #[must_use]
    pub fn with_burst_size(mut self, size: u32) -> Self {
        self.burst_size = size;
        self
    }

    /// Enable or disable rate limiting
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Choose between admitting and rejecting on store failure
    #[must_use]
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Set the store round-trip bound
    #[must_use]
    pub fn with_op_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.op_timeout_ms = timeout_ms;
        self
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Tight limits that reject when the store is down
    #[must_use]
    pub fn strict() -> Self {
        Self {
            requests_per_second: 2.0,
            burst_size: 5,
            fail_open: false,
            ..Self::default()
        }
    }

    /// Generous limits for trusted callers
    #[must_use]
    pub fn relaxed() -> Self {
        Self {
            requests_per_second: 100.0,
            burst_size: 200,
            ..Self::default()
        }
    }

    /// Reject settings that can never admit a request
    pub fn validate(&self) -> Result<()> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(GatewayError::Config(format!(
                "rate_limit.requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        if self.burst_size == 0 {
            return Err(GatewayError::Config(
                "rate_limit.burst_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Idle time after which a full bucket can be forgotten
    pub fn bucket_ttl_ms(&self) -> u64 {
        let refill_ms = (f64::from(self.burst_size) * MILLI / self.requests_per_second).ceil();
        (refill_ms as u64).saturating_add(1_000)
    }
}

// =============================================================================
// Keys and Decisions
// =============================================================================

/// What a bucket is keyed on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Authenticated user
    User(i64),
    /// Client address
    Ip(IpAddr),
    /// Neither is known; all such requests share one bucket
    Anonymous,
}

impl RateLimitKey {
    /// Prefer the user id, then the client IP
    pub fn resolve(user_id: Option<i64>, ip: Option<IpAddr>) -> Self {
        match (user_id, ip) {
            (Some(id), _) => Self::User(id),
            (None, Some(ip)) => Self::Ip(ip),
            (None, None) => Self::Anonymous,
        }
    }

    /// Store key under `prefix`
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}{self}")
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Result of a rate limit check
#[derive(Clone, Debug, PartialEq)]
pub enum RateLimitDecision {
    /// A token was taken
    Allowed {
        /// Whole tokens left in the bucket
        remaining: u32,
    },

    /// The bucket is empty
    Rejected {
        /// Time until one token is available
        retry_after: Duration,
    },

    /// The store could not be reached and the limiter fails open
    Degraded,
}

impl RateLimitDecision {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Get the retry hint if rejected
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Running totals
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub rejected: u64,
    pub store_errors: u64,
}

/// Token bucket limiter over a [`BucketStore`]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    allowed: Counter,
    rejected: Counter,
    store_errors: Counter,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Limiter on the wall clock
    pub fn new(config: RateLimitConfig, store: Arc<dyn BucketStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Limiter on a caller-supplied clock
    pub fn with_clock(
        config: RateLimitConfig,
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            allowed: Counter::new(),
            rejected: Counter::new(),
            store_errors: Counter::new(),
        }
    }

    /// Take one token for `key`.
    ///
    /// Store failures and timeouts yield `Degraded` when failing open and a
    /// `Transient` error otherwise.
    pub async fn check(&self, key: &RateLimitKey) -> Result<RateLimitDecision> {
        self.evaluate(key, true).await
    }

    /// Like [`RateLimiter::check`] but leaves the bucket untouched. Only a
    /// rejection is counted.
    pub async fn peek(&self, key: &RateLimitKey) -> Result<RateLimitDecision> {
        self.evaluate(key, false).await
    }

    /// Like [`RateLimiter::check`], mapping rejection to `RateLimited`
    pub async fn enforce(&self, key: &RateLimitKey) -> Result<()> {
        rejection_to_error(key, self.check(key).await?)
    }

    /// Fail with `RateLimited` if `key` has no token left, without taking one
    pub async fn guard(&self, key: &RateLimitKey) -> Result<()> {
        rejection_to_error(key, self.peek(key).await?)
    }

    /// Drop buckets that have been idle past their TTL
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired(self.clock.now_ms())
    }

    /// Purge idle buckets every `interval`
    pub fn spawn_maintenance(&self, interval: Duration) -> PeriodicTask {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        PeriodicTask::spawn("rate-limit-maintenance", interval, move || {
            let removed = store.purge_expired(clock.now_ms());
            async move {
                if removed > 0 {
                    tracing::debug!(removed, "purged idle rate-limit buckets");
                }
            }
        })
    }

    async fn evaluate(&self, key: &RateLimitKey, consume: bool) -> Result<RateLimitDecision> {
        if !self.config.enabled {
            return Ok(RateLimitDecision::Allowed {
                remaining: self.config.burst_size,
            });
        }

        let params = BucketParams {
            rate: self.config.requests_per_second,
            burst: self.config.burst_size,
            now_ms: self.clock.now_ms(),
            ttl_ms: self.config.bucket_ttl_ms(),
        };
        let storage_key = key.storage_key(&self.config.key_prefix);
        let timeout = Duration::from_millis(self.config.op_timeout_ms);

        let eval = async {
            if consume {
                self.store.eval_token_bucket(&storage_key, params).await
            } else {
                self.store.peek_token_bucket(&storage_key, params).await
            }
        };
        let outcome = match tokio::time::timeout(timeout, eval).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return self.store_failed(key, e),
            Err(_) => return self.store_failed(key, GatewayError::timeout("rate limit", timeout)),
        };

        if outcome.allowed {
            if consume {
                self.allowed.inc();
            }
            Ok(RateLimitDecision::Allowed {
                remaining: (outcome.tokens_milli / MILLI).floor() as u32,
            })
        } else {
            self.rejected.inc();
            let missing = (MILLI - outcome.tokens_milli).max(0.0);
            let retry_after_ms = (missing / self.config.requests_per_second).ceil() as u64;
            tracing::debug!(key = %key, retry_after_ms, "rate limited");
            Ok(RateLimitDecision::Rejected {
                retry_after: Duration::from_millis(retry_after_ms),
            })
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counter snapshot
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed: self.allowed.get(),
            rejected: self.rejected.get(),
            store_errors: self.store_errors.get(),
        }
    }

    fn store_failed(&self, key: &RateLimitKey, error: GatewayError) -> Result<RateLimitDecision> {
        self.store_errors.inc();
        if self.config.fail_open {
            tracing::warn!(key = %key, error = %error, "rate limit store unavailable, admitting");
            Ok(RateLimitDecision::Degraded)
        } else {
            tracing::warn!(key = %key, error = %error, "rate limit store unavailable, rejecting");
            Err(error)
        }
    }
}

fn rejection_to_error(key: &RateLimitKey, decision: RateLimitDecision) -> Result<()> {
    match decision {
        RateLimitDecision::Rejected { retry_after } => Err(GatewayError::RateLimited {
            key: key.to_string(),
            retry_after,
        }),
        RateLimitDecision::Allowed { .. } | RateLimitDecision::Degraded => Ok(()),
    }
}
