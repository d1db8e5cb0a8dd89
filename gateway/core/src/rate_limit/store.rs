//! Token Bucket Backing Stores
//!
//! A bucket is `{tokens, ts}` where `tokens` is measured in milli-tokens and
//! `ts` is the last update in epoch milliseconds. Every store applies the
//! whole refill/consume/persist step as one atomic operation; callers never
//! read a bucket and write it back themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Milli-tokens per whole token
pub const MILLI: f64 = 1000.0;

/// Parameters for one bucket evaluation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketParams {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity in tokens
    pub burst: u32,
    /// Current time, epoch milliseconds
    pub now_ms: u64,
    /// Idle expiry of the persisted bucket
    pub ttl_ms: u64,
}

/// Result of a bucket evaluation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketOutcome {
    /// Whether one token was consumed
    pub allowed: bool,
    /// Milli-tokens left after the evaluation
    pub tokens_milli: f64,
}

/// Atomic token-bucket primitive
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill `key` for the elapsed time, then try to take one token
    async fn eval_token_bucket(&self, key: &str, params: BucketParams) -> Result<BucketOutcome>;

    /// Refill `key` for the elapsed time without taking a token or writing
    /// anything back. A key with no bucket reads as full.
    async fn peek_token_bucket(&self, key: &str, params: BucketParams) -> Result<BucketOutcome>;

    /// Drop buckets idle past their TTL; returns how many were dropped.
    ///
    /// Stores that expire keys on their own keep the default.
    fn purge_expired(&self, now_ms: u64) -> usize {
        let _ = now_ms;
        0
    }
}

/// Milli-tokens in the bucket at `params.now_ms`; a missing bucket is full.
///
/// Time is counted in whole milliseconds, so the first token after a drain
/// returns at `ceil(1000 / rate)` ms. That is exactly `1/rate` seconds when
/// `1/rate` is a whole number of milliseconds (rate 0.25 refills at 4000 ms)
/// and the next millisecond otherwise (rate 0.3 refills at 3334 ms, not 4 s).
pub(crate) fn refill(tokens_milli: Option<f64>, ts_ms: u64, params: &BucketParams) -> f64 {
    let capacity = f64::from(params.burst) * MILLI;
    match tokens_milli {
        Some(tokens) => {
            let elapsed_ms = params.now_ms.saturating_sub(ts_ms) as f64;
            // rate tokens/s is exactly rate milli-tokens/ms
            (tokens + elapsed_ms * params.rate).min(capacity)
        }
        None => capacity,
    }
}

/// One refill/consume step on plain values
pub(crate) fn step(tokens_milli: Option<f64>, ts_ms: u64, params: &BucketParams) -> BucketOutcome {
    let tokens = refill(tokens_milli, ts_ms, params);

    if tokens >= MILLI {
        BucketOutcome {
            allowed: true,
            tokens_milli: tokens - MILLI,
        }
    } else {
        BucketOutcome {
            allowed: false,
            tokens_milli: tokens,
        }
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of bucket timestamps
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Clock fixed at `now_ms`
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Move forward
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct BucketState {
    tokens_milli: f64,
    ts_ms: u64,
    expires_at_ms: u64,
}

/// Single-process bucket store; the map entry lock makes each step atomic
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: DashMap<String, BucketState>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket exists
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn eval_token_bucket(&self, key: &str, params: BucketParams) -> Result<BucketOutcome> {
        let mut entry = self.buckets.entry(key.to_owned()).or_insert(BucketState {
            tokens_milli: f64::from(params.burst) * MILLI,
            ts_ms: params.now_ms,
            expires_at_ms: 0,
        });
        let previous = (entry.expires_at_ms > params.now_ms).then_some(entry.tokens_milli);
        let outcome = step(previous, entry.ts_ms, &params);
        *entry = BucketState {
            tokens_milli: outcome.tokens_milli,
            ts_ms: params.now_ms,
            expires_at_ms: params.now_ms.saturating_add(params.ttl_ms),
        };
        Ok(outcome)
    }

    async fn peek_token_bucket(&self, key: &str, params: BucketParams) -> Result<BucketOutcome> {
        let tokens_milli = match self.buckets.get(key) {
            Some(state) if state.expires_at_ms > params.now_ms => {
                refill(Some(state.tokens_milli), state.ts_ms, &params)
            }
            _ => refill(None, params.now_ms, &params),
        };
        Ok(BucketOutcome {
            allowed: tokens_milli >= MILLI,
            tokens_milli,
        })
    }

    fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, state| state.expires_at_ms > now_ms);
        before.saturating_sub(self.buckets.len())
    }
}

// ============================================================================
// Redis store
// ============================================================================

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisBucketStore;

#[cfg(feature = "redis")]
mod redis_backend {
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;

    use super::{BucketOutcome, BucketParams, BucketStore};
    use crate::cache::remote::redis_transient;
    use crate::error::{GatewayError, Result};

    const TOKEN_BUCKET_LUA: &str = r"
        local key = KEYS[1]
        local rate = tonumber(ARGV[1])
        local capacity = tonumber(ARGV[2]) * 1000
        local now = tonumber(ARGV[3])
        local ttl = tonumber(ARGV[4])

        local state = redis.call('HMGET', key, 'tokens', 'ts')
        local tokens = tonumber(state[1])
        local ts = tonumber(state[2])
        if tokens == nil or ts == nil then
            tokens = capacity
        else
            local elapsed = math.max(0, now - ts)
            tokens = math.min(capacity, tokens + elapsed * rate)
        end

        local allowed = 0
        if tokens >= 1000 then
            tokens = tokens - 1000
            allowed = 1
        end

        redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', now)
        redis.call('PEXPIRE', key, ttl)
        return {allowed, tostring(tokens)}
    ";

    const PEEK_BUCKET_LUA: &str = r"
        local key = KEYS[1]
        local rate = tonumber(ARGV[1])
        local capacity = tonumber(ARGV[2]) * 1000
        local now = tonumber(ARGV[3])

        local state = redis.call('HMGET', key, 'tokens', 'ts')
        local tokens = tonumber(state[1])
        local ts = tonumber(state[2])
        if tokens == nil or ts == nil then
            tokens = capacity
        else
            local elapsed = math.max(0, now - ts)
            tokens = math.min(capacity, tokens + elapsed * rate)
        end

        local allowed = 0
        if tokens >= 1000 then
            allowed = 1
        end
        return {allowed, tostring(tokens)}
    ";

    /// Token buckets evaluated server-side by a Lua script; keys expire
    /// through `PEXPIRE`, so there is nothing to purge
    #[derive(Clone)]
    pub struct RedisBucketStore {
        conn: ConnectionManager,
        script: redis::Script,
        peek: redis::Script,
    }

    impl RedisBucketStore {
        /// Connect to `url`
        pub async fn connect(url: &str) -> Result<Self> {
            tracing::info!(url = %url, "connecting rate limiter to Redis");
            let client =
                redis::Client::open(url).map_err(|e| GatewayError::Config(e.to_string()))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(redis_transient)?;
            Ok(Self::from_connection(conn))
        }

        /// Wrap an existing connection manager
        pub fn from_connection(conn: ConnectionManager) -> Self {
            Self {
                conn,
                script: redis::Script::new(TOKEN_BUCKET_LUA),
                peek: redis::Script::new(PEEK_BUCKET_LUA),
            }
        }
    }

    impl RedisBucketStore {
        async fn run(
            &self,
            script: &redis::Script,
            key: &str,
            params: BucketParams,
        ) -> Result<BucketOutcome> {
            let mut conn = self.conn.clone();
            let (allowed, tokens): (i64, String) = script
                .key(key)
                .arg(params.rate)
                .arg(params.burst)
                .arg(params.now_ms)
                .arg(params.ttl_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(redis_transient)?;
            let tokens_milli = tokens.parse::<f64>().map_err(|e| {
                GatewayError::Transient(format!("bad token count {tokens:?} from script: {e}"))
            })?;
            Ok(BucketOutcome {
                allowed: allowed == 1,
                tokens_milli,
            })
        }
    }

    #[async_trait]
    impl BucketStore for RedisBucketStore {
        async fn eval_token_bucket(&self, key: &str, params: BucketParams) -> Result<BucketOutcome> {
            self.run(&self.script, key, params).await
        }

        async fn peek_token_bucket(&self, key: &str, params: BucketParams) -> Result<BucketOutcome> {
            self.run(&self.peek, key, params).await
        }
    }
}
