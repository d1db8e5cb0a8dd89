//! L1 in-process cache.
//!
//! A sharded map of key to `{value, expires_at}`. Expired entries are
//! invisible to readers immediately and are physically removed either lazily
//! on access or by the periodic sweep started with [`LocalCache::spawn_cleanup`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::task::PeriodicTask;

#[derive(Clone, Debug)]
struct LocalEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> LocalEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded TTL map used as the first cache tier
#[derive(Debug)]
pub struct LocalCache<V> {
    entries: DashMap<String, LocalEntry<V>>,
    max_entries: usize,
}

impl<V: Clone + Send + Sync + 'static> LocalCache<V> {
    /// Create a cache holding at most `max_entries` keys (0 = unbounded)
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Unexpired value for `key`
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    /// Remaining lifetime of `key`, if present and unexpired
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.expires_at - now)
    }

    /// Insert with a relative TTL
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.insert_until(key, value, Instant::now() + ttl);
    }

    /// Insert with an absolute deadline
    pub fn insert_until(&self, key: impl Into<String>, value: V, expires_at: Instant) {
        let key = key.into();
        if self.max_entries > 0
            && self.entries.len() >= self.max_entries
            && !self.entries.contains_key(&key)
        {
            self.make_room();
        }
        self.entries.insert(key, LocalEntry { value, expires_at });
    }

    /// Remove a key, returning its value if it was present
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Apply `f` to the stored value in place, keeping its expiry
    pub fn update<F: FnOnce(&mut V)>(&self, key: &str, f: F) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Remove everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep expired entries every `interval`
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let cache = Arc::clone(self);
        PeriodicTask::spawn("l1-cleanup", interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "purged expired L1 entries");
                }
            }
        })
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 {
            return;
        }
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
