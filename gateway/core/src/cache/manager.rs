//! Two-tier cache for user and token snapshots.
//!
//! # Lookup path
//!
//! ```text
//! get_user_cache(id)
//!   1. bloom filter        -> definitely absent?  NotFound
//!   2. L1 (local, short)   -> hit?                return
//!   3. singleflight        -> one leader per key, the rest wait
//!   4. L2 (remote, long)   -> hit?                fill L1, return
//!   5. authoritative store -> ok?                 fill L1 + L2 + bloom
//! ```
//!
//! L1 never outlives L2: an L1 entry's deadline is the smaller of the L1 TTL
//! and the time left on the snapshot's L2 expiry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};

use super::bloom::BloomFilter;
use super::local::LocalCache;
use super::remote::RemoteCache;
use super::singleflight::Group;
use crate::error::{GatewayError, Result};
use crate::metrics::Counter;
use crate::store::{AccountStatus, TokenRecord, TokenStore, UserRecord, UserStore};
use crate::task::PeriodicTask;

// ============================================================================
// Configuration
// ============================================================================

/// Tuning for the user and token caches
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 lifetime
    pub l1_ttl: Duration,
    /// L2 lifetime
    pub l2_ttl: Duration,
    /// Maximum L1 entries per cache (0 = unbounded)
    pub l1_max_entries: usize,
    /// Gate user lookups through a bloom filter
    pub bloom_enabled: bool,
    /// Expected number of distinct users
    pub bloom_capacity: usize,
    /// Target bloom false-positive rate
    pub bloom_fp_rate: f64,
    /// Deadline for each L2 call
    pub op_timeout: Duration,
    /// L1 sweep interval; the gateway purges idle rate-limit buckets on the same period
    pub cleanup_interval: Duration,
    /// Namespace prepended to every L2 key
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_ttl: Duration::from_secs(30),
            l2_ttl: Duration::from_secs(300),
            l1_max_entries: 100_000,
            bloom_enabled: true,
            bloom_capacity: 1_000_000,
            bloom_fp_rate: 0.01,
            op_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            key_prefix: "gw:".to_string(),
        }
    }
}

impl CacheConfig {
    /// Defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the L1 lifetime
    #[must_use]
    pub fn with_l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl = ttl;
        self
    }

    /// Set the L2 lifetime
    #[must_use]
    pub fn with_l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl = ttl;
        self
    }

    /// Enable or disable the bloom gate
    #[must_use]
    pub fn with_bloom(mut self, enabled: bool) -> Self {
        self.bloom_enabled = enabled;
        self
    }

    /// Size the bloom filter
    #[must_use]
    pub fn with_bloom_capacity(mut self, capacity: usize, fp_rate: f64) -> Self {
        self.bloom_capacity = capacity;
        self.bloom_fp_rate = fp_rate;
        self
    }

    /// Set the L2 call deadline
    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.l1_ttl.is_zero() || self.l2_ttl.is_zero() {
            return Err(GatewayError::Config("cache TTLs must be positive".into()));
        }
        if self.l1_ttl > self.l2_ttl {
            return Err(GatewayError::Config(format!(
                "L1 TTL {:?} exceeds L2 TTL {:?}",
                self.l1_ttl, self.l2_ttl
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Cached Values
// ============================================================================

/// A snapshot that records when it was cached and when its L2 copy expires
pub trait CachedValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wall-clock expiry of the L2 copy
    fn expires_at(&self) -> DateTime<Utc>;

    /// Record cache timestamps
    fn stamp(&mut self, cached_at: DateTime<Utc>, expires_at: DateTime<Utc>);
}

/// Cached view of a user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCacheEntry {
    /// User id
    pub user_id: i64,
    /// Login name
    pub username: String,
    /// Contact address
    pub email: String,
    /// Remaining quota at snapshot time
    pub quota: i64,
    /// Account status
    pub status: AccountStatus,
    /// Channel group
    pub group: String,
    /// L2 expiry
    pub expires_at: DateTime<Utc>,
    /// When the snapshot was taken
    pub cached_at: DateTime<Utc>,
}

impl UserCacheEntry {
    /// Whether the user may make requests
    pub fn is_enabled(&self) -> bool {
        self.status == AccountStatus::Enabled
    }
}

impl From<UserRecord> for UserCacheEntry {
    fn from(user: UserRecord) -> Self {
        let now = Utc::now();
        Self {
            user_id: user.id,
            username: user.username,
            email: user.email,
            quota: user.quota,
            status: user.status,
            group: user.group,
            expires_at: now,
            cached_at: now,
        }
    }
}

impl CachedValue for UserCacheEntry {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn stamp(&mut self, cached_at: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.cached_at = cached_at;
        self.expires_at = expires_at;
    }
}

/// Cached view of an API token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCacheEntry {
    /// Token row at snapshot time
    pub token: TokenRecord,
    /// L2 expiry
    pub expires_at: DateTime<Utc>,
    /// When the snapshot was taken
    pub cached_at: DateTime<Utc>,
}

impl From<TokenRecord> for TokenCacheEntry {
    fn from(token: TokenRecord) -> Self {
        let now = Utc::now();
        Self {
            token,
            expires_at: now,
            cached_at: now,
        }
    }
}

impl CachedValue for TokenCacheEntry {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn stamp(&mut self, cached_at: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.cached_at = cached_at;
        self.expires_at = expires_at;
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters shared by every tier
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Served from L1
    pub l1_hits: Counter,
    /// Served from L2
    pub l2_hits: Counter,
    /// Fell through to the authoritative store
    pub store_fetches: Counter,
    /// Waited on another caller's flight
    pub coalesced: Counter,
    /// Rejected by the bloom filter
    pub bloom_rejections: Counter,
    /// L2 calls that failed or timed out
    pub l2_errors: Counter,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Served from L1
    pub l1_hits: u64,
    /// Served from L2
    pub l2_hits: u64,
    /// Fell through to the authoritative store
    pub store_fetches: u64,
    /// Waited on another caller's flight
    pub coalesced: u64,
    /// Rejected by the bloom filter
    pub bloom_rejections: u64,
    /// L2 calls that failed or timed out
    pub l2_errors: u64,
}

impl CacheStats {
    /// Copy the counters
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            l1_hits: self.l1_hits.get(),
            l2_hits: self.l2_hits.get(),
            store_fetches: self.store_fetches.get(),
            coalesced: self.coalesced.get(),
            bloom_rejections: self.bloom_rejections.get(),
            l2_errors: self.l2_errors.get(),
        }
    }
}

/// Which tier answered a lookup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheTier {
    /// Process-local
    L1,
    /// Shared remote cache
    L2,
    /// Authoritative store
    Store,
}

// ============================================================================
// Tiered Cache
// ============================================================================

/// L1 + L2 + singleflight for one value type
pub struct TieredCache<V> {
    namespace: String,
    local: Arc<LocalCache<V>>,
    remote: Arc<dyn RemoteCache>,
    flights: Group<(V, CacheTier)>,
    stats: Arc<CacheStats>,
    l1_ttl: Duration,
    l2_ttl: Duration,
    op_timeout: Duration,
}

impl<V: CachedValue> TieredCache<V> {
    /// Build a cache whose L2 keys start with `namespace`
    pub fn new(
        namespace: impl Into<String>,
        config: &CacheConfig,
        remote: Arc<dyn RemoteCache>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            local: Arc::new(LocalCache::new(config.l1_max_entries)),
            remote,
            flights: Group::new(),
            stats,
            l1_ttl: config.l1_ttl,
            l2_ttl: config.l2_ttl,
            op_timeout: config.op_timeout,
        }
    }

    /// Full L2 key for `id`
    pub fn key(&self, id: &str) -> String {
        format!("{}{id}", self.namespace)
    }

    /// The L1 store, for maintenance
    pub fn local(&self) -> &Arc<LocalCache<V>> {
        &self.local
    }

    /// Look `id` up through L1, L2 and finally `load`.
    ///
    /// Concurrent misses for the same id share a single execution of the L2
    /// lookup and `load`. An L2 failure is logged and treated as a miss; an
    /// error is returned only when `load` fails.
    pub async fn get_or_load<F, Fut>(&self, id: &str, load: F) -> Result<(V, CacheTier)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let key = self.key(id);
        if let Some(value) = self.local.get(&key) {
            self.stats.l1_hits.inc();
            return Ok((value, CacheTier::L1));
        }

        let (result, shared) = self
            .flights
            .work(&key, || {
                let fill = Filler {
                    key: key.clone(),
                    local: Arc::clone(&self.local),
                    remote: Arc::clone(&self.remote),
                    stats: Arc::clone(&self.stats),
                    l1_ttl: self.l1_ttl,
                    l2_ttl: self.l2_ttl,
                    op_timeout: self.op_timeout,
                };
                let load = load();
                async move { fill.run(load).await }
            })
            .await;

        if shared {
            self.stats.coalesced.inc();
        }
        result
    }

    /// Write `value` to L1 then L2; if L2 fails the L1 write is rolled back
    pub async fn set(&self, id: &str, mut value: V) -> Result<V> {
        let key = self.key(id);
        let now = Utc::now();
        value.stamp(now, now + chrono_duration(self.l2_ttl));

        self.local
            .insert_until(key.clone(), value.clone(), l1_deadline(self.l1_ttl, &value));
        if let Err(e) = self.remote_set(&key, &value, self.l2_ttl).await {
            self.local.remove(&key);
            return Err(e);
        }
        Ok(value)
    }

    /// Remove `id` from L1 and L2
    pub async fn invalidate(&self, id: &str) -> Result<()> {
        let key = self.key(id);
        self.local.remove(&key);
        let result = match timeout(self.op_timeout, self.remote.delete(&key)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout("L2 delete", self.op_timeout)),
        };
        result.inspect_err(|_| self.stats.l2_errors.inc())
    }

    /// Rewrite a cached snapshot in both tiers, keeping its expiry.
    ///
    /// Returns `false` when neither tier holds a live copy.
    pub async fn modify<F: FnOnce(&mut V)>(&self, id: &str, f: F) -> Result<bool> {
        let key = self.key(id);
        let current = match self.local.get(&key) {
            Some(value) => Some(value),
            None => self.remote_get(&key).await?,
        };
        let Some(mut value) = current else {
            return Ok(false);
        };

        f(&mut value);
        let Ok(remaining) = (value.expires_at() - Utc::now()).to_std() else {
            self.invalidate(id).await?;
            return Ok(false);
        };
        self.local
            .insert_until(key.clone(), value.clone(), l1_deadline(self.l1_ttl, &value));
        self.remote_set(&key, &value, remaining).await?;
        Ok(true)
    }

    async fn remote_get(&self, key: &str) -> Result<Option<V>> {
        let raw = match timeout(self.op_timeout, self.remote.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout("L2 get", self.op_timeout)),
        }
        .inspect_err(|_| self.stats.l2_errors.inc())?;
        Ok(raw.and_then(|raw| decode(key, &raw)))
    }

    async fn remote_set(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let result = match timeout(self.op_timeout, self.remote.set(key, raw, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout("L2 set", self.op_timeout)),
        };
        result.inspect_err(|_| self.stats.l2_errors.inc())
    }
}

/// Owned state for one coalesced miss
struct Filler<V> {
    key: String,
    local: Arc<LocalCache<V>>,
    remote: Arc<dyn RemoteCache>,
    stats: Arc<CacheStats>,
    l1_ttl: Duration,
    l2_ttl: Duration,
    op_timeout: Duration,
}

impl<V: CachedValue> Filler<V> {
    async fn run<Fut>(self, load: Fut) -> Result<(V, CacheTier)>
    where
        Fut: Future<Output = Result<V>> + Send,
    {
        // another flight may have filled L1 between our miss and this flight
        if let Some(value) = self.local.get(&self.key) {
            self.stats.l1_hits.inc();
            return Ok((value, CacheTier::L1));
        }

        match timeout(self.op_timeout, self.remote.get(&self.key)).await {
            Ok(Ok(Some(raw))) => {
                if let Some(value) = decode::<V>(&self.key, &raw) {
                    if value.expires_at() > Utc::now() {
                        self.stats.l2_hits.inc();
                        self.local.insert_until(
                            self.key.clone(),
                            value.clone(),
                            l1_deadline(self.l1_ttl, &value),
                        );
                        return Ok((value, CacheTier::L2));
                    }
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                self.stats.l2_errors.inc();
                tracing::warn!(key = %self.key, error = %e, "L2 lookup failed, falling back to store");
            }
            Err(_) => {
                self.stats.l2_errors.inc();
                tracing::warn!(key = %self.key, timeout_ms = self.op_timeout.as_millis() as u64, "L2 lookup timed out, falling back to store");
            }
        }

        self.stats.store_fetches.inc();
        let mut value = load.await?;
        let now = Utc::now();
        value.stamp(now, now + chrono_duration(self.l2_ttl));

        self.local
            .insert_until(self.key.clone(), value.clone(), l1_deadline(self.l1_ttl, &value));
        match serde_json::to_string(&value) {
            Ok(raw) => match timeout(self.op_timeout, self.remote.set(&self.key, raw, self.l2_ttl)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.l2_errors.inc();
                    tracing::warn!(key = %self.key, error = %e, "L2 write-back failed");
                }
                Err(_) => {
                    self.stats.l2_errors.inc();
                    tracing::warn!(key = %self.key, "L2 write-back timed out");
                }
            },
            Err(e) => tracing::warn!(key = %self.key, error = %e, "cannot encode cache entry"),
        }

        Ok((value, CacheTier::Store))
    }
}

fn decode<V: DeserializeOwned>(key: &str, raw: &str) -> Option<V> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "discarding undecodable L2 entry");
            None
        }
    }
}

fn l1_deadline<V: CachedValue>(l1_ttl: Duration, value: &V) -> Instant {
    let l2_left = (value.expires_at() - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    Instant::now() + l1_ttl.min(l2_left)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    // capped so adding it to `Utc::now()` cannot overflow
    chrono::Duration::from_std(d.min(Duration::from_secs(100 * 365 * 86_400)))
        .unwrap_or_else(|_| chrono::Duration::days(365))
}

// ============================================================================
// Cache Manager
// ============================================================================

/// User and token caches plus the bloom gate
pub struct CacheManager {
    config: CacheConfig,
    bloom: Option<BloomFilter>,
    users: TieredCache<UserCacheEntry>,
    tokens: TieredCache<TokenCacheEntry>,
    user_store: Arc<dyn UserStore>,
    token_store: Arc<dyn TokenStore>,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build the caches; fails if the configuration is inconsistent
    pub fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteCache>,
        user_store: Arc<dyn UserStore>,
        token_store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        config.validate()?;
        let bloom = if config.bloom_enabled {
            Some(BloomFilter::new(config.bloom_capacity, config.bloom_fp_rate)?)
        } else {
            None
        };
        let stats = Arc::new(CacheStats::default());
        let users = TieredCache::new(
            format!("{}user:", config.key_prefix),
            &config,
            Arc::clone(&remote),
            Arc::clone(&stats),
        );
        let tokens = TieredCache::new(
            format!("{}token:", config.key_prefix),
            &config,
            remote,
            Arc::clone(&stats),
        );

        Ok(Self {
            config,
            bloom,
            users,
            tokens,
            user_store,
            token_store,
            stats,
        })
    }

    /// Resolve a user snapshot.
    ///
    /// Ids the bloom filter has never seen are rejected with `NotFound`
    /// without touching any tier; call [`CacheManager::warm_bloom`] at start-up.
    pub async fn get_user_cache(&self, user_id: i64) -> Result<UserCacheEntry> {
        let id = user_id.to_string();
        if let Some(bloom) = &self.bloom {
            if !bloom.contains(id.as_bytes()) {
                self.stats.bloom_rejections.inc();
                tracing::debug!(user_id, "bloom filter rejected unknown user");
                return Err(GatewayError::NotFound(format!("user {user_id}")));
            }
        }

        let store = Arc::clone(&self.user_store);
        let (entry, tier) = self
            .users
            .get_or_load(&id, move || async move {
                store.get_user(user_id).await.map(UserCacheEntry::from)
            })
            .await?;

        if tier == CacheTier::Store {
            self.register_user(user_id);
        }
        tracing::trace!(user_id, tier = ?tier, "user cache lookup");
        Ok(entry)
    }

    /// Store a snapshot in both tiers and mark the id as known
    pub async fn set_user_cache(&self, entry: UserCacheEntry) -> Result<UserCacheEntry> {
        let user_id = entry.user_id;
        let entry = self.users.set(&user_id.to_string(), entry).await?;
        self.register_user(user_id);
        Ok(entry)
    }

    /// Drop a user from both tiers. The bloom filter keeps the id.
    pub async fn invalidate_user_cache(&self, user_id: i64) -> Result<()> {
        self.users.invalidate(&user_id.to_string()).await
    }

    /// Overwrite the cached quota after an authoritative debit
    pub async fn sync_user_quota(&self, user_id: i64, remaining: i64) -> Result<bool> {
        self.users
            .modify(&user_id.to_string(), |entry| entry.quota = remaining)
            .await
    }

    /// Resolve an API token snapshot
    pub async fn get_token_cache(&self, key: &str) -> Result<TokenCacheEntry> {
        let store = Arc::clone(&self.token_store);
        let owned = key.to_owned();
        let (entry, _) = self
            .tokens
            .get_or_load(key, move || async move {
                store.get_token(&owned).await.map(TokenCacheEntry::from)
            })
            .await?;
        Ok(entry)
    }

    /// Drop a token from both tiers
    pub async fn invalidate_token_cache(&self, key: &str) -> Result<()> {
        self.tokens.invalidate(key).await
    }

    /// Mark a user id as existing
    pub fn register_user(&self, user_id: i64) {
        if let Some(bloom) = &self.bloom {
            bloom.add(user_id.to_string().as_bytes());
        }
    }

    /// Load every known user id into the bloom filter
    pub async fn warm_bloom(&self) -> Result<usize> {
        let Some(bloom) = &self.bloom else {
            return Ok(0);
        };
        let started = Instant::now();
        let ids = self.user_store.list_user_ids().await?;
        for id in &ids {
            bloom.add(id.to_string().as_bytes());
        }
        if ids.len() > self.config.bloom_capacity {
            tracing::warn!(
                users = ids.len(),
                capacity = self.config.bloom_capacity,
                "bloom filter over capacity, false-positive rate will exceed target"
            );
        }
        tracing::info!(users = ids.len(), elapsed_ms = started.elapsed().as_millis() as u64, "bloom filter warmed");
        Ok(ids.len())
    }

    /// Periodically sweep expired L1 entries from both caches
    pub fn spawn_maintenance(&self, interval: Duration) -> PeriodicTask {
        let users = Arc::clone(self.users.local());
        let tokens = Arc::clone(self.tokens.local());
        PeriodicTask::spawn("cache-maintenance", interval, move || {
            let removed = users.purge_expired() + tokens.purge_expired();
            async move {
                if removed > 0 {
                    tracing::debug!(removed, "swept expired L1 entries");
                }
            }
        })
    }

    /// The bloom filter, when enabled
    pub fn bloom(&self) -> Option<&BloomFilter> {
        self.bloom.as_ref()
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
