//! Channel Cache
//!
//! Model-indexed view of every enabled channel. The index is immutable once
//! built: `refresh` loads from the store without holding any lock, builds a
//! new index, and swaps a single `Arc`. Readers clone the `Arc` and never
//! block writers for longer than the swap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::channel::{Channel, ChannelId, ChannelStore};
use crate::error::{GatewayError, Result};
use crate::metrics::Counter;
use crate::task::PeriodicTask;

#[derive(Clone, Debug, Default)]
struct ChannelIndex {
    by_model: HashMap<String, Vec<Channel>>,
    all: Vec<Channel>,
    refreshed_at: Option<Instant>,
}

impl ChannelIndex {
    fn build(mut channels: Vec<Channel>) -> Self {
        channels.retain(|c| {
            if !c.enabled {
                return false;
            }
            match c.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(channel_id = c.id, error = %e, "skipping invalid channel");
                    false
                }
            }
        });
        channels.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.weight.cmp(&a.weight))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut by_model: HashMap<String, Vec<Channel>> = HashMap::new();
        for channel in &channels {
            for model in &channel.models {
                let list = by_model.entry(model.clone()).or_default();
                if list.last().map(|c| c.id) != Some(channel.id) {
                    list.push(channel.clone());
                }
            }
        }

        Self {
            by_model,
            all: channels,
            refreshed_at: Some(Instant::now()),
        }
    }
}

/// Periodically refreshed registry of enabled channels
pub struct ChannelCache {
    store: Arc<dyn ChannelStore>,
    index: RwLock<Arc<ChannelIndex>>,
    ttl: Duration,
    last_attempt: Mutex<Option<Instant>>,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshes: Counter,
    refresh_failures: Counter,
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        f.debug_struct("ChannelCache")
            .field("channels", &index.all.len())
            .field("models", &index.by_model.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ChannelCache {
    /// Empty cache; the first lookup triggers a load
    pub fn new(store: Arc<dyn ChannelStore>, ttl: Duration) -> Self {
        Self {
            store,
            index: RwLock::new(Arc::new(ChannelIndex::default())),
            ttl,
            last_attempt: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshes: Counter::new(),
            refresh_failures: Counter::new(),
        }
    }

    /// Reload from the store and swap the index. Returns the channel count.
    pub async fn refresh(&self) -> Result<usize> {
        *self.last_attempt.lock() = Some(Instant::now());
        let channels = match self.store.load_enabled().await {
            Ok(channels) => channels,
            Err(e) => {
                self.refresh_failures.inc();
                return Err(e);
            }
        };

        let index = Arc::new(ChannelIndex::build(channels));
        let count = index.all.len();
        let models = index.by_model.len();
        *self.index.write() = index;
        self.refreshes.inc();

        tracing::debug!(channels = count, models, "channel cache refreshed");
        Ok(count)
    }

    /// Channels serving `model`, best priority first.
    ///
    /// Refreshes first when the data is older than the TTL. If that refresh
    /// fails but an earlier load succeeded, the old data is served.
    pub async fn get_available_channels(&self, model: &str) -> Result<Vec<Channel>> {
        if self.is_stale() {
            let _guard = self.refresh_lock.lock().await;
            if self.is_stale() {
                if let Err(e) = self.refresh().await {
                    if self.last_refresh().is_none() {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "channel refresh failed, serving stale data");
                }
            }
        }

        let index = self.snapshot();
        index
            .by_model
            .get(model)
            .filter(|channels| !channels.is_empty())
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("no enabled channel for model {model}")))
    }

    /// Remove one channel from every index without a reload.
    ///
    /// Returns false if the channel was not cached.
    pub fn invalidate_channel(&self, id: ChannelId) -> bool {
        let mut guard = self.index.write();
        if !guard.all.iter().any(|c| c.id == id) {
            return false;
        }
        let index = Arc::make_mut(&mut guard);
        index.all.retain(|c| c.id != id);
        for channels in index.by_model.values_mut() {
            channels.retain(|c| c.id != id);
        }
        index.by_model.retain(|_, channels| !channels.is_empty());
        drop(guard);

        tracing::info!(channel_id = id, "channel removed from cache");
        true
    }

    /// Every cached channel
    pub fn channels(&self) -> Vec<Channel> {
        self.snapshot().all.clone()
    }

    /// Look up a cached channel by id
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.snapshot().all.iter().find(|c| c.id == id).cloned()
    }

    /// Models with at least one channel
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.snapshot().by_model.keys().cloned().collect();
        models.sort();
        models
    }

    /// When the index was last rebuilt
    pub fn last_refresh(&self) -> Option<Instant> {
        self.index.read().refreshed_at
    }

    /// Successful and failed refresh counts
    pub fn refresh_counts(&self) -> (u64, u64) {
        (self.refreshes.get(), self.refresh_failures.get())
    }

    /// Refresh on a fixed interval
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let cache = Arc::clone(self);
        PeriodicTask::spawn("channel-refresh", interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                if let Err(e) = cache.refresh().await {
                    tracing::warn!(error = %e, "periodic channel refresh failed");
                }
            }
        })
    }

    fn snapshot(&self) -> Arc<ChannelIndex> {
        Arc::clone(&self.index.read())
    }

    /// Never loaded, or last attempt older than the TTL. An index that has
    /// never loaded is retried on every lookup so the caller sees the store
    /// error rather than an empty channel list.
    fn is_stale(&self) -> bool {
        if self.last_refresh().is_none() {
            return true;
        }
        match *self.last_attempt.lock() {
            Some(at) => at.elapsed() > self.ttl,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::channel::InMemoryChannelStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ids(channels: &[Channel]) -> Vec<ChannelId> {
        channels.iter().map(|c| c.id).collect()
    }

    /// Store that can be switched into a failing state
    struct FlakyStore {
        inner: InMemoryChannelStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ChannelStore for FlakyStore {
        async fn load_enabled(&self) -> Result<Vec<Channel>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(GatewayError::Transient("db down".into()));
            }
            self.inner.load_enabled().await
        }
    }

    #[tokio::test]
    async fn test_ordered_by_priority_then_weight() {
        let store = Arc::new(InMemoryChannelStore::new(vec![
            Channel::new(1, ["gpt-4o"]).with_priority(0).with_weight(50),
            Channel::new(2, ["gpt-4o"]).with_priority(10).with_weight(1),
            Channel::new(3, ["gpt-4o", "gpt-4o-mini"]).with_priority(10).with_weight(9),
            Channel::new(4, ["gpt-4o"]).with_enabled(false),
        ]));
        let cache = ChannelCache::new(store, Duration::from_secs(60));

        let channels = cache.get_available_channels("gpt-4o").await.unwrap();
        assert_eq!(ids(&channels), vec![3, 2, 1]);
        assert_eq!(cache.models(), vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let store = Arc::new(InMemoryChannelStore::new(vec![Channel::new(1, ["a"])]));
        let cache = ChannelCache::new(store, Duration::from_secs(60));
        let err = cache.get_available_channels("b").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_after_ttl() {
        let store = Arc::new(InMemoryChannelStore::new(vec![Channel::new(1, ["a"])]));
        let cache = ChannelCache::new(store.clone(), Duration::from_secs(30));
        assert_eq!(cache.get_available_channels("a").await.unwrap().len(), 1);

        store.upsert(Channel::new(2, ["a"]));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get_available_channels("a").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get_available_channels("a").await.unwrap().len(), 2);
        assert_eq!(cache.refresh_counts(), (2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_serves_stale_data() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryChannelStore::new(vec![Channel::new(1, ["a"])]),
            failing: AtomicBool::new(true),
        });
        let cache = ChannelCache::new(store.clone(), Duration::from_secs(5));

        // nothing to fall back on yet
        assert!(cache.get_available_channels("a").await.unwrap_err().is_retryable());

        store.failing.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_available_channels("a").await.unwrap().len(), 1);

        store.failing.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_available_channels("a").await.unwrap().len(), 1);
        assert_eq!(cache.refresh_counts(), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_load_is_not_reported_as_unknown_model() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryChannelStore::new(vec![Channel::new(1, ["gpt-4o"])]),
            failing: AtomicBool::new(true),
        });
        let cache = ChannelCache::new(store.clone(), Duration::from_secs(60));

        for _ in 0..2 {
            let err = cache.get_available_channels("gpt-4o").await.unwrap_err();
            assert_eq!(err, GatewayError::Transient("db down".into()));
        }
        assert_eq!(cache.refresh_counts(), (0, 2));

        // the store recovers well inside the TTL
        store.failing.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ids(&cache.get_available_channels("gpt-4o").await.unwrap()), vec![1]);
        assert_eq!(cache.refresh_counts(), (1, 2));
    }

    #[tokio::test]
    async fn test_invalidate_channel_removes_from_every_model() {
        let store = Arc::new(InMemoryChannelStore::new(vec![
            Channel::new(1, ["a", "b"]),
            Channel::new(2, ["a"]),
        ]));
        let cache = ChannelCache::new(store, Duration::from_secs(60));
        cache.refresh().await.unwrap();

        let before = cache.get_available_channels("a").await.unwrap();
        assert!(cache.invalidate_channel(1));
        assert!(!cache.invalidate_channel(1));

        assert_eq!(ids(&cache.get_available_channels("a").await.unwrap()), vec![2]);
        assert!(cache.get_available_channels("b").await.is_err());
        assert!(cache.get(1).is_none());
        // copies handed out earlier are unaffected
        assert_eq!(before.len(), 2);
    }
}
