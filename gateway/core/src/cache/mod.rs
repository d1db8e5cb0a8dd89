//! User/Auth State Caching
//!
//! ```text
//! +------------------+
//! |   CacheManager   |  <-- user + token snapshots
//! +--------+---------+
//!          |
//!   +------+-------+
//!   |              |
//!   v              v
//! +-------+   +----------+
//! | Bloom |   |  Tiered  |  L1 (LocalCache) -> singleflight -> L2 (RemoteCache)
//! +-------+   +----------+                                        |
//!                                                                 v
//!                                                       authoritative store
//! ```

pub mod bloom;
pub mod local;
pub mod manager;
pub mod remote;
pub mod singleflight;

pub use bloom::BloomFilter;
pub use local::LocalCache;
pub use manager::{
    CacheConfig, CacheManager, CacheStats, CacheStatsSnapshot, CacheTier, CachedValue,
    TieredCache, TokenCacheEntry, UserCacheEntry,
};
pub use remote::{InMemoryRemoteCache, RemoteCache};
#[cfg(feature = "redis")]
pub use remote::RedisRemoteCache;
pub use singleflight::Group;
