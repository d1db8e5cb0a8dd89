//! Channel Selector
//!
//! Picks one channel for a `(model, strategy)` pair:
//!
//! ```text
//! 1. ChannelCache::get_available_channels(model)
//! 2. Drop channels the user's group may not use
//! 3. Drop channels in the exclude set (earlier failed attempts)
//! 4. Apply the strategy function
//! ```
//!
//! `select_with_retry` repeats this, excluding each failed channel, until an
//! attempt succeeds, the attempt budget is spent, or no candidate is left.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::cache::ChannelCache;
use super::channel::{Channel, ChannelId};
use super::stats::StatsTracker;
use super::strategy::{SelectionContext, Strategy};
use crate::error::{GatewayError, Result};

// ============================================================================
// Requests and Results
// ============================================================================

/// Who is asking, for group-restricted channels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
    pub group: String,
}

/// A selection request
#[derive(Clone, Debug)]
pub struct SelectRequest {
    /// Requested model
    pub model: String,
    /// Strategy override; the selector default applies when `None`
    pub strategy: Option<Strategy>,
    /// Requesting user
    pub user: Option<UserContext>,
    /// Channels that must not be chosen
    pub exclude: HashSet<ChannelId>,
}

impl SelectRequest {
    /// Request for `model` with no constraints
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            strategy: None,
            user: None,
            exclude: HashSet::new(),
        }
    }

    /// Use a specific strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Restrict to channels serving this user's group
    #[must_use]
    pub fn with_user(mut self, user_id: i64, group: impl Into<String>) -> Self {
        self.user = Some(UserContext {
            user_id,
            group: group.into(),
        });
        self
    }

    /// Never pick `id`
    #[must_use]
    pub fn excluding(mut self, id: ChannelId) -> Self {
        self.exclude.insert(id);
        self
    }
}

/// Outcome of a selection
#[derive(Clone, Debug)]
pub struct SelectResult {
    /// Chosen channel (a copy; the cache is never mutated through it)
    pub channel: Channel,
    /// 1-based attempt number that produced this channel
    pub attempt: u32,
    /// Strategy that was applied
    pub strategy: Strategy,
    /// Number of eligible candidates at selection time
    pub candidates: usize,
}

// ============================================================================
// Configuration
// ============================================================================

/// Selector behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Strategy used when a request does not name one
    pub default_strategy: Strategy,
    /// Attempts made by `select_with_retry`
    pub max_retries: u32,
    /// Invalidate a channel in the cache after this many consecutive failures
    pub auto_disable_after: Option<u32>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Weight,
            max_retries: 3,
            auto_disable_after: Some(5),
        }
    }
}

impl SelectorConfig {
    /// Defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default strategy
    #[must_use]
    pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Set the attempt budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set (or disable with `None`) the auto-invalidation threshold
    #[must_use]
    pub fn with_auto_disable_after(mut self, failures: Option<u32>) -> Self {
        self.auto_disable_after = failures;
        self
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Strategy-driven channel picker
pub struct ChannelSelector {
    cache: Arc<ChannelCache>,
    stats: Arc<StatsTracker>,
    config: SelectorConfig,
    rng: Mutex<StdRng>,
    cursors: DashMap<String, AtomicUsize>,
}

impl std::fmt::Debug for ChannelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSelector")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ChannelSelector {
    pub fn new(cache: Arc<ChannelCache>, stats: Arc<StatsTracker>, config: SelectorConfig) -> Self {
        Self::with_rng(cache, stats, config, StdRng::from_entropy())
    }

    /// Deterministic selector for tests and simulations
    pub fn with_seed(
        cache: Arc<ChannelCache>,
        stats: Arc<StatsTracker>,
        config: SelectorConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(cache, stats, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        cache: Arc<ChannelCache>,
        stats: Arc<StatsTracker>,
        config: SelectorConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            cache,
            stats,
            config,
            rng: Mutex::new(rng),
            cursors: DashMap::new(),
        }
    }

    /// Choose a channel for `req`
    pub async fn select(&self, req: &SelectRequest) -> Result<SelectResult> {
        let mut channels = self.cache.get_available_channels(&req.model).await?;
        if let Some(user) = &req.user {
            channels.retain(|c| c.serves_group(&user.group));
            if channels.is_empty() {
                return Err(GatewayError::NotFound(format!(
                    "no channel for model {} in group {}",
                    req.model, user.group
                )));
            }
        }

        let total = channels.len();
        channels.retain(|c| !req.exclude.contains(&c.id));
        if channels.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "all {total} channel(s) for model {} are excluded",
                req.model
            )));
        }

        let strategy = req.strategy.unwrap_or(self.config.default_strategy);
        let index = self.pick(&req.model, strategy, &channels).ok_or_else(|| {
            GatewayError::NotFound(format!("strategy {strategy} chose no channel"))
        })?;
        let candidates = channels.len();
        let channel = channels.swap_remove(index);

        tracing::debug!(
            model = %req.model,
            channel_id = channel.id,
            strategy = %strategy,
            candidates,
            "channel selected"
        );
        Ok(SelectResult {
            channel,
            attempt: 1,
            strategy,
            candidates,
        })
    }

    /// Select and run `attempt` against the channel, moving on to another
    /// channel when it fails.
    ///
    /// Each failed channel is recorded with [`ChannelSelector::mark_channel_failed`]
    /// and excluded from later attempts. Stops after `max_retries` attempts
    /// (at least one) or when every candidate has been excluded, returning
    /// `RetriesExhausted` with every attempt's error. `Cancelled` aborts at
    /// once. Success is not recorded here; the caller reports latency once
    /// the request is complete.
    pub async fn select_with_retry<T, F, Fut>(
        &self,
        mut req: SelectRequest,
        max_retries: u32,
        mut attempt: F,
    ) -> Result<(T, SelectResult)>
    where
        F: FnMut(Channel) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_retries.max(1);
        let mut errors = Vec::new();

        for n in 1..=max_attempts {
            let selected = match self.select(&req).await {
                Ok(selected) => selected,
                Err(GatewayError::NotFound(_)) if n > 1 => break,
                Err(e) => return Err(e),
            };
            let channel_id = selected.channel.id;

            match attempt(selected.channel.clone()).await {
                Ok(value) => {
                    return Ok((
                        value,
                        SelectResult {
                            attempt: n,
                            ..selected
                        },
                    ))
                }
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        model = %req.model,
                        channel_id,
                        attempt = n,
                        error = %e,
                        "relay attempt failed"
                    );
                    self.mark_channel_failed(channel_id, &e.to_string());
                    errors.push(format!("channel {channel_id}: {e}"));
                    req.exclude.insert(channel_id);
                }
            }
        }

        Err(GatewayError::RetriesExhausted {
            model: req.model,
            attempts: u32::try_from(errors.len()).unwrap_or(u32::MAX),
            errors,
        })
    }

    /// Record a failure and, past the configured threshold, drop the channel
    /// from the cache until the next refresh. Returns true if it was dropped.
    pub fn mark_channel_failed(&self, id: ChannelId, reason: &str) -> bool {
        let consecutive = self.stats.record_failure(id, reason);
        match self.config.auto_disable_after {
            Some(threshold) if consecutive >= threshold => {
                let removed = self.cache.invalidate_channel(id);
                if removed {
                    tracing::warn!(channel_id = id, consecutive, reason, "channel auto-disabled");
                }
                removed
            }
            _ => false,
        }
    }

    /// Shared statistics
    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    /// Underlying channel cache
    pub fn cache(&self) -> &Arc<ChannelCache> {
        &self.cache
    }

    /// Active configuration
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    fn pick(&self, model: &str, strategy: Strategy, candidates: &[Channel]) -> Option<usize> {
        if !self.cursors.contains_key(model) {
            self.cursors.entry(model.to_owned()).or_default();
        }
        let cursor = self.cursors.get(model)?;
        let mut rng = self.rng.lock();
        let mut ctx = SelectionContext {
            rng: &mut *rng,
            cursor: &cursor,
            stats: &self.stats,
        };
        (strategy.func())(candidates, &mut ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::channel::InMemoryChannelStore;
    use std::time::Duration;

    fn selector(channels: Vec<Channel>, config: SelectorConfig) -> ChannelSelector {
        let store = Arc::new(InMemoryChannelStore::new(channels));
        let cache = Arc::new(ChannelCache::new(store, Duration::from_secs(60)));
        ChannelSelector::with_seed(cache, Arc::new(StatsTracker::default()), config, 42)
    }

    fn three() -> Vec<Channel> {
        (1..=3).map(|i| Channel::new(i, ["gpt-4o"])).collect()
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let selector = selector(three(), SelectorConfig::new());
        let req = SelectRequest::new("gpt-4o").with_strategy(Strategy::RoundRobin);
        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(selector.select(&req).await.unwrap().channel.id);
        }
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_round_robin_cursor_is_per_instance() {
        let a = selector(three(), SelectorConfig::new());
        let b = selector(three(), SelectorConfig::new());
        let req = SelectRequest::new("gpt-4o").with_strategy(Strategy::RoundRobin);
        a.select(&req).await.unwrap();
        a.select(&req).await.unwrap();
        assert_eq!(b.select(&req).await.unwrap().channel.id, 1);
    }

    #[tokio::test]
    async fn test_excluded_channels_never_selected() {
        let selector = selector(three(), SelectorConfig::new());
        let req = SelectRequest::new("gpt-4o").excluding(1).excluding(3);
        for strategy in Strategy::ALL {
            let req = req.clone().with_strategy(strategy);
            for _ in 0..20 {
                assert_eq!(selector.select(&req).await.unwrap().channel.id, 2);
            }
        }

        let all = req.excluding(2);
        assert!(matches!(selector.select(&all).await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_group_restriction() {
        let channels = vec![
            Channel::new(1, ["m"]).with_groups(["vip"]),
            Channel::new(2, ["m"]),
        ];
        let selector = selector(channels, SelectorConfig::new());
        let req = SelectRequest::new("m").with_user(1, "default");
        for _ in 0..20 {
            assert_eq!(selector.select(&req).await.unwrap().channel.id, 2);
        }

        let only_vip = selector_with_vip_only();
        let err = only_vip
            .select(&SelectRequest::new("m").with_user(1, "default"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("group default"));
    }

    fn selector_with_vip_only() -> ChannelSelector {
        selector(
            vec![Channel::new(1, ["m"]).with_groups(["vip"])],
            SelectorConfig::new(),
        )
    }

    #[tokio::test]
    async fn test_retry_moves_to_next_channel() {
        let ranked = (1..=3)
            .map(|i| Channel::new(i, ["gpt-4o"]).with_priority(10 - i as i64))
            .collect();
        let selector = selector(ranked, SelectorConfig::new());
        let req = SelectRequest::new("gpt-4o").with_strategy(Strategy::Priority);

        let mut tried = Vec::new();
        let (value, result) = selector
            .select_with_retry(req, 3, |channel| {
                tried.push(channel.id);
                let id = channel.id;
                async move {
                    if id == 3 {
                        Ok("done")
                    } else {
                        Err(GatewayError::Transient(format!("channel {id} down")))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(result.channel.id, 3);
        assert_eq!(result.attempt, 3);
        assert_eq!(tried, vec![1, 2, 3]);
        assert_eq!(selector.stats().get(1).unwrap().failure_count, 1);
        assert!(selector.stats().get(3).is_none());
    }

    #[tokio::test]
    async fn test_retry_exhausts_candidates() {
        let selector = selector(three(), SelectorConfig::new());
        let err = selector
            .select_with_retry(SelectRequest::new("gpt-4o"), 10, |channel| async move {
                Err::<(), _>(GatewayError::Transient(format!("{} down", channel.id)))
            })
            .await
            .unwrap_err();

        match err {
            GatewayError::RetriesExhausted { attempts, errors, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(errors.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_retry_respects_attempt_budget() {
        let selector = selector(three(), SelectorConfig::new());
        let mut calls = 0;
        let err = selector
            .select_with_retry(SelectRequest::new("gpt-4o"), 2, |_| {
                calls += 1;
                async { Err::<(), _>(GatewayError::Transient("down".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_aborts_retry() {
        let selector = selector(three(), SelectorConfig::new());
        let mut calls = 0;
        let err = selector
            .select_with_retry(SelectRequest::new("gpt-4o"), 3, |_| {
                calls += 1;
                async { Err::<(), _>(GatewayError::Cancelled) }
            })
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_without_retry() {
        let selector = selector(three(), SelectorConfig::new());
        let err = selector
            .select_with_retry(SelectRequest::new("nope"), 3, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_failed_auto_disables_after_threshold() {
        let selector = selector(
            three(),
            SelectorConfig::new().with_auto_disable_after(Some(2)),
        );
        selector.cache().refresh().await.unwrap();

        assert!(!selector.mark_channel_failed(1, "timeout"));
        assert!(selector.mark_channel_failed(1, "timeout"));
        assert!(selector.cache().get(1).is_none());

        let never = selector_no_policy();
        never.cache().refresh().await.unwrap();
        for _ in 0..10 {
            assert!(!never.mark_channel_failed(1, "timeout"));
        }
        assert!(never.cache().get(1).is_some());
    }

    fn selector_no_policy() -> ChannelSelector {
        selector(three(), SelectorConfig::new().with_auto_disable_after(None))
    }
}
