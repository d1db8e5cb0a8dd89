//! L2 cache backends.
//!
//! The shared tier only needs string get/set-with-TTL/delete/exists. Values
//! are JSON documents produced by the cache manager.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::Result;

/// Remote key-value store with per-key expiry
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch a value; `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove a key; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether an unexpired value exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime of a key
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

/// Process-local stand-in for the shared cache, used in tests and
/// single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryRemoteCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryRemoteCache {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (including expired, unswept ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str) -> Option<(String, Instant)> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.1 > now)
            .map(|e| e.value().clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| e.1 <= now);
        }
        hit
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key).map(|(v, _)| v))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self.live(key).map(|(_, at)| at - now))
    }
}

#[cfg(feature = "redis")]
pub(crate) use self::redis_backend::transient as redis_transient;
#[cfg(feature = "redis")]
pub use self::redis_backend::RedisRemoteCache;

#[cfg(feature = "redis")]
mod redis_backend {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    use super::RemoteCache;
    use crate::error::{GatewayError, Result};

    /// Redis-backed L2 tier
    #[derive(Clone)]
    pub struct RedisRemoteCache {
        conn: ConnectionManager,
    }

    impl RedisRemoteCache {
        /// Connect to `url` (e.g. `redis://127.0.0.1/`)
        pub async fn connect(url: &str) -> Result<Self> {
            tracing::info!(url = %url, "connecting L2 cache to Redis");
            let client = redis::Client::open(url).map_err(|e| GatewayError::Config(e.to_string()))?;
            let conn = ConnectionManager::new(client).await.map_err(transient)?;
            Ok(Self { conn })
        }

        /// Wrap an existing connection manager
        pub fn from_connection(conn: ConnectionManager) -> Self {
            Self { conn }
        }
    }

    pub(crate) fn transient(err: redis::RedisError) -> GatewayError {
        GatewayError::Transient(format!("redis: {err}"))
    }

    #[async_trait]
    impl RemoteCache for RedisRemoteCache {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn.clone();
            conn.get(key).await.map_err(transient)
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await
                .map_err(transient)?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = conn.del(key).await.map_err(transient)?;
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            let mut conn = self.conn.clone();
            conn.exists(key).await.map_err(transient)
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            let mut conn = self.conn.clone();
            let millis: i64 = conn.pttl(key).await.map_err(transient)?;
            Ok(u64::try_from(millis).ok().map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_ttl() {
        let cache = InMemoryRemoteCache::new();
        cache
            .set("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(cache.exists("k").await.unwrap());
        assert_eq!(cache.ttl("k").await.unwrap(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let cache = InMemoryRemoteCache::new();
        cache.delete("nope").await.unwrap();
        cache
            .set("k", "v".into(), Duration::from_secs(1))
            .await
            .unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
