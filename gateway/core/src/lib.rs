//! Gateway Core - Admission, Routing and Billing for an LLM API Gateway
//!
//! This crate decides, for every inbound LLM API call, whether it may proceed
//! and which upstream channel serves it, then settles the quota debit off the
//! request path. HTTP handling and vendor protocols live outside; they plug in
//! through [`relay::RelayHandler`] and the store traits in [`store`].
//!
//! # Architecture
//!
//! ```text
//!   request ──► CredentialChain ──► CacheManager (token) ──► RateLimiter
//!                                                                 │
//!                                      CacheManager (user, quota) ◄┘
//!                                                 │
//!                                             Admission
//!                                                 │
//!                  ChannelSelector::select_with_retry ──► RelayHandler
//!                     │            ▲
//!                     ▼            │ latency / failures
//!               ChannelCache   StatsTracker
//!                                                 │
//!                                           BillingEvent
//!                                                 ▼
//!         BillingEventQueue ──► Consumer ×N ──► QuotaLedger
//!                                   │
//!                                   └──► DeadLetterQueue
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: wires every component and exposes `admit` / `relay`
//! - [`ChannelSelector`]: strategy-based channel choice with retry
//! - [`CacheManager`]: bloom-gated two-tier user and token cache
//! - [`RateLimiter`]: atomic per-user token bucket
//! - [`AsyncBillingService`]: bounded queue, consumers and dead letters
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::{config, Gateway, GatewayBackends, InMemoryStore, RequestParts};
//!
//! let config = config::load_config()?;
//! let store = Arc::new(InMemoryStore::new());
//! let backends = GatewayBackends::from_config(&config, store).await?;
//! let gateway = Gateway::new(config, backends)?;
//! gateway.start().await?;
//!
//! let parts = RequestParts::new().with_header("Authorization", "Bearer sk-...");
//! let admission = gateway.admit(&parts, "gpt-4o").await?;
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod routing;
pub mod store;
pub mod task;
pub mod telemetry;

pub use auth::{Credential, CredentialChain, CredentialExtractor, CredentialSource, RequestParts};
pub use billing::{
    AsyncBillingService, BillingConfig, BillingEvent, BillingEventQueue, DeadLetterQueue,
    EventQueue, PricingTable,
};
pub use cache::{BloomFilter, CacheConfig, CacheManager, TokenCacheEntry, UserCacheEntry};
pub use config::{ConfigError, ConfigOverrides, ConfigSource, GatewayConfig};
pub use error::{GatewayError, Result};
pub use gateway::{Admission, Gateway, GatewayBackends, RelayOutcome};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitKey, RateLimiter};
pub use relay::{Capability, RelayHandler, RelayRequest, RelayResponse, Usage};
pub use routing::{
    Channel, ChannelCache, ChannelId, ChannelSelector, SelectRequest, SelectResult,
    SelectorConfig, StatsTracker, Strategy,
};
pub use store::{InMemoryStore, QuotaLedger, TokenStore, UserStore};
