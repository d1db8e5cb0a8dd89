//! Admission pipeline
//!
//! ```text
//! RequestParts
//!   -> CredentialChain        (no key: IP bucket, then NotFound)
//!   -> IP bucket peek         (drained by failed keys: RateLimited, no lookup)
//!   -> token cache            (unknown key: IP bucket, then Forbidden;
//!                              status, expiry, model allow-list, token quota)
//!   -> RateLimiter            (keyed by user id)
//!   -> user cache             (enabled, quota > 0)
//!   => Admission
//!
//! relay(admission)
//!   -> ChannelSelector::select_with_retry -> RelayHandler
//!   -> BillingEvent -> AsyncBillingService (debit settles later)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::{CredentialChain, CredentialSource, RequestParts};
use crate::billing::{AsyncBillingService, BillingEvent};
use crate::cache::{CacheManager, InMemoryRemoteCache, RemoteCache, UserCacheEntry};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::rate_limit::{
    BucketStore, Clock, InMemoryBucketStore, RateLimitKey, RateLimiter, SystemClock,
};
use crate::relay::{Capability, RelayHandler, RelayRequest, RelayResponse, Usage};
use crate::routing::{
    Channel, ChannelCache, ChannelId, ChannelSelector, ChannelStore, InMemoryChannelStore,
    SelectRequest, StatsTracker,
};
use crate::store::{AccountStatus, QuotaLedger, TokenRecord, TokenStore, UserStore};
use crate::task::PeriodicTask;

// ============================================================================
// Backends
// ============================================================================

/// External stores the gateway reads from and writes to
pub struct GatewayBackends {
    pub channels: Arc<dyn ChannelStore>,
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    /// L2 tier of the user and token caches
    pub remote: Arc<dyn RemoteCache>,
    /// Rate-limit buckets
    pub buckets: Arc<dyn BucketStore>,
    /// Time source of the rate limiter
    pub clock: Arc<dyn Clock>,
}

impl GatewayBackends {
    /// Process-local backends around one store that serves users, tokens and quota
    pub fn in_memory<S>(channels: Vec<Channel>, store: Arc<S>) -> Self
    where
        S: UserStore + TokenStore + QuotaLedger + 'static,
    {
        Self {
            channels: Arc::new(InMemoryChannelStore::new(channels)),
            users: store.clone(),
            tokens: store.clone(),
            ledger: store,
            remote: Arc::new(InMemoryRemoteCache::new()),
            buckets: Arc::new(InMemoryBucketStore::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Drive the rate limiter from `clock`
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// In-memory backends, with Redis for L2 and buckets when `redis_url` is set
    pub async fn from_config<S>(config: &GatewayConfig, store: Arc<S>) -> Result<Self>
    where
        S: UserStore + TokenStore + QuotaLedger + 'static,
    {
        let backends = Self::in_memory(config.channels.clone(), store);
        match config.redis_url.as_deref() {
            Some(url) => backends.with_redis(url).await,
            None => Ok(backends),
        }
    }

    #[cfg(feature = "redis")]
    async fn with_redis(mut self, url: &str) -> Result<Self> {
        self.remote = Arc::new(crate::cache::RedisRemoteCache::connect(url).await?);
        self.buckets = Arc::new(crate::rate_limit::RedisBucketStore::connect(url).await?);
        tracing::info!("using redis for L2 cache and rate-limit buckets");
        Ok(self)
    }

    #[cfg(not(feature = "redis"))]
    async fn with_redis(self, _url: &str) -> Result<Self> {
        tracing::warn!("redis_url set but the redis feature is disabled, using in-memory backends");
        Ok(self)
    }
}

// ============================================================================
// Admission
// ============================================================================

/// An authenticated, rate-checked caller with quota left
#[derive(Clone, Debug)]
pub struct Admission {
    pub user: UserCacheEntry,
    pub token: TokenRecord,
    pub credential_source: CredentialSource,
}

/// What a relayed request produced
#[derive(Clone, Debug)]
pub struct RelayOutcome {
    pub response: RelayResponse,
    pub channel_id: ChannelId,
    /// 1-based attempt that succeeded
    pub attempt: u32,
    pub latency: Duration,
}

// ============================================================================
// Gateway
// ============================================================================

/// Wires admission, routing and billing together
pub struct Gateway {
    config: GatewayConfig,
    credentials: CredentialChain,
    cache: Arc<CacheManager>,
    limiter: RateLimiter,
    channels: Arc<ChannelCache>,
    selector: ChannelSelector,
    billing: AsyncBillingService,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("credentials", &self.credentials)
            .field("selector", &self.selector)
            .field("billing", &self.billing)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Validate `config` and assemble every component. Nothing runs until
    /// [`Gateway::start`].
    pub fn new(config: GatewayConfig, backends: GatewayBackends) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(StatsTracker::new(config.latency_alpha));
        let channels = Arc::new(ChannelCache::new(backends.channels, config.channel_cache_ttl));
        let selector =
            ChannelSelector::new(Arc::clone(&channels), Arc::clone(&stats), config.selector.clone());
        let cache = Arc::new(CacheManager::new(
            config.cache.clone(),
            backends.remote,
            backends.users,
            backends.tokens,
        )?);
        let limiter =
            RateLimiter::with_clock(config.rate_limit.clone(), backends.buckets, backends.clock);
        let billing =
            AsyncBillingService::new(config.billing.clone(), backends.ledger, config.pricing.clone())?
                .with_channel_stats(stats)
                .with_cache(Arc::clone(&cache));

        Ok(Self {
            config,
            credentials: CredentialChain::default(),
            cache,
            limiter,
            channels,
            selector,
            billing,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Replace the credential chain
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialChain) -> Self {
        self.credentials = credentials;
        self
    }

    /// Warm the bloom filter and channel index, then start billing and the
    /// background refresh and sweep tasks. Idle rate-limit buckets are purged
    /// on the cache cleanup interval.
    pub async fn start(&self) -> Result<()> {
        let users = self.cache.warm_bloom().await?;
        let channels = self.channels.refresh().await?;
        self.billing.start()?;

        let mut tasks = self.tasks.lock();
        tasks.push(self.channels.spawn_refresh(self.config.channel_refresh_interval));
        tasks.push(self.cache.spawn_maintenance(self.config.cache.cleanup_interval));
        tasks.push(self.limiter.spawn_maintenance(self.config.cache.cleanup_interval));
        tracing::info!(users, channels, "gateway started");
        Ok(())
    }

    /// Stop background tasks and billing; pending retries go back to the queue
    pub async fn shutdown(&self) {
        let tasks: Vec<PeriodicTask> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
        self.billing.stop().await;
        tracing::info!("gateway stopped");
    }

    /// Authenticate and admit a request for `model`.
    ///
    /// Fails with `NotFound` (no key), `Forbidden` (unknown, disabled or
    /// expired key, model not allowed, disabled user), `RateLimited`, or
    /// `QuotaExhausted`. Once an address has used up its bucket on missing or
    /// unknown keys, every request from it is `RateLimited` until the bucket
    /// refills, valid keys included.
    pub async fn admit(&self, parts: &RequestParts, model: &str) -> Result<Admission> {
        // only missing or unknown keys draw from the address bucket
        let address = RateLimitKey::resolve(None, parts.client_ip);
        let credential = match self.credentials.extract(parts) {
            Ok(credential) => credential,
            Err(e) => {
                self.limiter.enforce(&address).await?;
                return Err(e);
            }
        };

        // an address out of failed-key allowance never reaches the token store
        self.limiter.guard(&address).await?;
        let token = match self.cache.get_token_cache(&credential.key).await {
            Ok(entry) => entry.token,
            Err(GatewayError::NotFound(_)) => {
                self.limiter.enforce(&address).await?;
                return Err(GatewayError::Forbidden("invalid API key".into()));
            }
            Err(e) => return Err(e),
        };
        check_token(&token, model)?;

        self.limiter
            .enforce(&RateLimitKey::resolve(Some(token.user_id), parts.client_ip))
            .await?;

        let user = self.cache.get_user_cache(token.user_id).await?;
        if !user.is_enabled() {
            return Err(GatewayError::Forbidden(format!("user {} is disabled", user.user_id)));
        }
        if user.quota <= 0 {
            return Err(GatewayError::QuotaExhausted {
                user_id: user.user_id,
                remaining: user.quota,
                required: 1,
            });
        }

        tracing::debug!(user_id = user.user_id, token_id = token.id, model, "request admitted");
        Ok(Admission {
            user,
            token,
            credential_source: credential.source,
        })
    }

    /// Forward `request` through the selected channel, retrying on other
    /// channels, and queue the billing event.
    pub async fn relay(
        &self,
        admission: &Admission,
        capability: Capability,
        request: &RelayRequest,
        handler: &dyn RelayHandler,
    ) -> Result<RelayOutcome> {
        let ((response, latency), selected) = self
            .selector
            .select_with_retry(
                self.select_request(admission, request),
                self.config.selector.max_retries,
                |channel| async move {
                    let started = Instant::now();
                    let response = handler.handle(&channel, capability, request).await?;
                    Ok((response, started.elapsed()))
                },
            )
            .await?;

        let channel_id = selected.channel.id;
        self.bill(admission, request, channel_id, response.usage, latency).await;
        Ok(RelayOutcome {
            response,
            channel_id,
            attempt: selected.attempt,
            latency,
        })
    }

    /// Streaming variant of [`Gateway::relay`].
    ///
    /// A failed attempt is retried on another channel, so handlers should
    /// only return retryable errors before the first chunk is sent.
    pub async fn relay_stream(
        &self,
        admission: &Admission,
        capability: Capability,
        request: &RelayRequest,
        handler: &dyn RelayHandler,
        chunks: mpsc::Sender<String>,
    ) -> Result<Usage> {
        let ((usage, latency), selected) = self
            .selector
            .select_with_retry(
                self.select_request(admission, request),
                self.config.selector.max_retries,
                |channel| {
                    let chunks = chunks.clone();
                    async move {
                        let started = Instant::now();
                        let usage = handler
                            .handle_stream(&channel, capability, request, chunks)
                            .await?;
                        Ok((usage, started.elapsed()))
                    }
                },
            )
            .await?;

        self.bill(admission, request, selected.channel.id, usage, latency).await;
        Ok(usage)
    }

    fn select_request(&self, admission: &Admission, request: &RelayRequest) -> SelectRequest {
        SelectRequest::new(request.model.clone())
            .with_user(admission.user.user_id, admission.user.group.clone())
    }

    async fn bill(
        &self,
        admission: &Admission,
        request: &RelayRequest,
        channel_id: ChannelId,
        usage: Usage,
        latency: Duration,
    ) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let event = BillingEvent::new(
            admission.user.user_id,
            request.model.clone(),
            u64::from(usage.prompt_tokens),
            u64::from(usage.completion_tokens),
        )
        .with_channel(channel_id, latency_ms)
        .with_token(admission.token.id)
        .with_request_id(request.request_id.clone());

        let event_id = event.event_id;
        if let Err(e) = self.billing.submit(event).await {
            tracing::warn!(
                %event_id,
                user_id = admission.user.user_id,
                request_id = %request.request_id,
                error = %e,
                "billing event not queued"
            );
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn channels(&self) -> &Arc<ChannelCache> {
        &self.channels
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn billing(&self) -> &AsyncBillingService {
        &self.billing
    }
}

fn check_token(token: &TokenRecord, model: &str) -> Result<()> {
    if token.status != AccountStatus::Enabled {
        return Err(GatewayError::Forbidden(format!("token {} is disabled", token.id)));
    }
    if token.expires_at.is_some_and(|at| at <= Utc::now()) {
        return Err(GatewayError::Forbidden(format!("token {} has expired", token.id)));
    }
    if !token.allows_model(model) {
        return Err(GatewayError::Forbidden(format!(
            "token {} may not use model {model}",
            token.id
        )));
    }
    if !token.unlimited_quota && token.remain_quota <= 0 {
        return Err(GatewayError::QuotaExhausted {
            user_id: token.user_id,
            remaining: token.remain_quota,
            required: 1,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::store::{InMemoryStore, UserRecord};

    fn gateway(store: Arc<InMemoryStore>, rate_limit: RateLimitConfig) -> Gateway {
        let config = GatewayConfig {
            rate_limit,
            channels: vec![Channel::new(1, ["gpt-4o"])],
            ..GatewayConfig::default()
        };
        Gateway::new(config.clone(), GatewayBackends::in_memory(config.channels, store)).unwrap()
    }

    fn store_with(token: TokenRecord, user: UserRecord) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.put_token(token);
        store.put_user(user);
        store
    }

    fn bearer(key: &str) -> RequestParts {
        RequestParts::new()
            .with_header("Authorization", format!("Bearer sk-{key}"))
            .with_client_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_admits_valid_token() {
        let store = store_with(TokenRecord::new(7, "abc", 1), UserRecord::new(1, "alice", 100));
        let gw = gateway(store, RateLimitConfig::default());
        gw.cache().register_user(1);

        let admission = gw.admit(&bearer("abc"), "gpt-4o").await.unwrap();
        assert_eq!(admission.user.user_id, 1);
        assert_eq!(admission.token.id, 7);
        assert_eq!(admission.credential_source, CredentialSource::Bearer);
    }

    #[tokio::test]
    async fn test_token_checks() {
        let mut disabled = TokenRecord::new(1, "disabled", 1);
        disabled.status = AccountStatus::Disabled;
        let mut expired = TokenRecord::new(2, "expired", 1);
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let mut narrow = TokenRecord::new(3, "narrow", 1);
        narrow.models = vec!["gpt-4o-mini".into()];
        let mut drained = TokenRecord::new(4, "drained", 1);
        drained.unlimited_quota = false;

        let store = Arc::new(InMemoryStore::new());
        store.put_user(UserRecord::new(1, "alice", 100));
        for token in [disabled, expired, narrow, drained] {
            store.put_token(token);
        }
        let gw = gateway(store, RateLimitConfig::disabled());

        for key in ["disabled", "expired", "narrow"] {
            let err = gw.admit(&bearer(key), "gpt-4o").await.unwrap_err();
            assert!(matches!(err, GatewayError::Forbidden(_)), "{key}: {err}");
        }
        let err = gw.admit(&bearer("drained"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExhausted { .. }));
        let err = gw.admit(&bearer("unknown"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_user_checks() {
        let mut user = UserRecord::new(1, "alice", 0);
        let store = store_with(TokenRecord::new(1, "abc", 1), user.clone());
        let gw = gateway(store.clone(), RateLimitConfig::disabled());
        gw.cache().register_user(1);

        let err = gw.admit(&bearer("abc"), "gpt-4o").await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::QuotaExhausted {
                user_id: 1,
                remaining: 0,
                required: 1
            }
        );

        user.quota = 10;
        user.status = AccountStatus::Disabled;
        store.put_user(user);
        gw.cache().invalidate_user_cache(1).await.unwrap();
        let err = gw.admit(&bearer("abc"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_by_user() {
        let store = store_with(TokenRecord::new(1, "abc", 1), UserRecord::new(1, "alice", 100));
        let limits = RateLimitConfig::new()
            .with_requests_per_second(0.001)
            .with_burst_size(2);
        let gw = gateway(store, limits);
        gw.cache().register_user(1);

        gw.admit(&bearer("abc"), "gpt-4o").await.unwrap();
        gw.admit(&bearer("abc"), "gpt-4o").await.unwrap();
        let err = gw.admit(&bearer("abc"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { ref key, .. } if key == "user:1"));
    }

    #[tokio::test]
    async fn test_missing_key_counts_against_ip() {
        let gw = gateway(
            Arc::new(InMemoryStore::new()),
            RateLimitConfig::new()
                .with_requests_per_second(0.001)
                .with_burst_size(1),
        );
        let anonymous = RequestParts::new().with_client_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let err = gw.admit(&anonymous, "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        let err = gw.admit(&anonymous, "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { ref key, .. } if key == "ip:127.0.0.1"));
    }

    #[tokio::test]
    async fn test_guessed_keys_stop_reaching_the_token_store() {
        let store = store_with(TokenRecord::new(1, "abc", 1), UserRecord::new(1, "alice", 100));
        let gw = gateway(
            store.clone(),
            RateLimitConfig::new()
                .with_requests_per_second(0.001)
                .with_burst_size(1),
        );
        gw.cache().register_user(1);

        let mut rate_limited = 0;
        for n in 0..50 {
            match gw.admit(&bearer(&format!("guess-{n}")), "gpt-4o").await {
                Err(GatewayError::Forbidden(_)) => {}
                Err(GatewayError::RateLimited { .. }) => rate_limited += 1,
                other => panic!("unexpected admission result: {other:?}"),
            }
        }
        assert_eq!(rate_limited, 49);
        assert_eq!(store.token_fetches(), 1);

        // the valid key from the same address waits for the refill too
        let err = gw.admit(&bearer("abc"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { ref key, .. } if key == "ip:127.0.0.1"));
        assert_eq!(store.token_fetches(), 1);
    }

    #[tokio::test]
    async fn test_valid_keys_do_not_drain_the_address_bucket() {
        let store = store_with(TokenRecord::new(1, "abc", 1), UserRecord::new(1, "alice", 100));
        let limits = RateLimitConfig::new()
            .with_requests_per_second(0.001)
            .with_burst_size(3);
        let gw = gateway(store, limits);
        gw.cache().register_user(1);

        for _ in 0..3 {
            gw.admit(&bearer("abc"), "gpt-4o").await.unwrap();
        }
        let err = gw.admit(&bearer("abc"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { ref key, .. } if key == "user:1"));
        // the address still has its whole allowance for a mistyped key
        let err = gw.admit(&bearer("typo"), "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }
}
