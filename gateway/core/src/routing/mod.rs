//! Channel Routing
//!
//! ```text
//! SelectRequest(model, strategy, user, exclude)
//!        |
//!        v
//! +-----------------+    get_available_channels    +--------------+
//! | ChannelSelector | ---------------------------> | ChannelCache | <-- ChannelStore
//! +-----------------+                              +--------------+
//!        |   ^
//!        |   | average latency, failure counts
//!        v   |
//! +-----------------+
//! |  StatsTracker   |
//! +-----------------+
//! ```
//!
//! The cache owns the channel index, the selector owns strategy state
//! (randomness and round-robin cursors), and the tracker owns the live
//! per-channel counters shared with the billing consumers.

#![allow(missing_docs)]

pub mod cache;
pub mod channel;
pub mod selector;
pub mod stats;
pub mod strategy;

pub use cache::ChannelCache;
pub use channel::{Channel, ChannelId, ChannelStore, InMemoryChannelStore};
pub use selector::{ChannelSelector, SelectRequest, SelectResult, SelectorConfig, UserContext};
pub use stats::{ChannelStats, StatsTracker, DEFAULT_LATENCY_ALPHA};
pub use strategy::{SelectionContext, Strategy, StrategyFn};
