//! TOML Configuration File Support
//!
//! Gateway settings live in `~/.config/llm-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. Programmatic overrides ([`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! redis_url = "redis://127.0.0.1:6379"
//!
//! [selector]
//! default_strategy = "weight"
//! max_retries = 3
//! auto_disable_after = 5      # 0 disables
//! latency_alpha = 0.3
//!
//! [channel_cache]
//! ttl_secs = 60
//! refresh_interval_secs = 30
//!
//! [cache]
//! l1_ttl_ms = 30000
//! l2_ttl_secs = 300
//! bloom_capacity = 1000000
//! bloom_fp_rate = 0.01
//!
//! [rate_limit]
//! requests_per_second = 10.0
//! burst_size = 20
//! fail_open = true
//!
//! [billing]
//! queue_capacity = 10000
//! consumers = 4
//! max_retry = 3
//! retry_delay_ms = 1000
//!
//! [[channels]]
//! id = 1
//! name = "openai-primary"
//! models = ["gpt-4o", "gpt-4o-mini"]
//! weight = 70
//!
//! [pricing.gpt-4o]
//! input_per_1k = 2.5
//! output_per_1k = 10.0
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::{BillingConfig, ModelPricing, PricingTable};
use crate::cache::CacheConfig;
use crate::error::GatewayError;
use crate::rate_limit::RateLimitConfig;
use crate::routing::{Channel, SelectorConfig, Strategy, DEFAULT_LATENCY_ALPHA};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ValidationError(msg) => Self::Config(msg),
            other => Self::Config(other.to_string()),
        }
    }
}

fn invalid(err: GatewayError) -> ConfigError {
    match err {
        GatewayError::Config(msg) => ConfigError::ValidationError(msg),
        other => ConfigError::ValidationError(other.to_string()),
    }
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from [`ConfigOverrides`]
    Override,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[selector]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorToml {
    /// Strategy name (`weight`, `priority`, `round_robin`, `lowest_latency`, `random`)
    pub default_strategy: Option<String>,

    /// Attempts made by `select_with_retry`
    pub max_retries: Option<u32>,

    /// Consecutive failures before a channel is invalidated; 0 disables
    pub auto_disable_after: Option<u32>,

    /// EMA smoothing factor for channel latency
    pub latency_alpha: Option<f64>,
}

/// `[channel_cache]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCacheToml {
    /// Index age after which a lookup triggers a reload
    pub ttl_secs: Option<u64>,

    /// Background refresh period
    pub refresh_interval_secs: Option<u64>,
}

/// `[cache]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    pub l1_ttl_ms: Option<u64>,
    pub l2_ttl_secs: Option<u64>,
    pub l1_max_entries: Option<usize>,
    pub bloom_enabled: Option<bool>,
    pub bloom_capacity: Option<usize>,
    pub bloom_fp_rate: Option<f64>,
    pub op_timeout_ms: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub key_prefix: Option<String>,
}

/// `[rate_limit]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    pub requests_per_second: Option<f64>,
    pub burst_size: Option<u32>,
    pub enabled: Option<bool>,
    pub fail_open: Option<bool>,
    pub key_prefix: Option<String>,
    pub op_timeout_ms: Option<u64>,
}

/// `[billing]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingToml {
    pub queue_capacity: Option<usize>,
    pub consumers: Option<usize>,
    pub max_retry: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub op_timeout_ms: Option<u64>,
    pub dlq_capacity: Option<usize>,
    pub stats_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Shared L2 cache and rate-limit store
    pub redis_url: Option<String>,

    pub selector: SelectorToml,

    pub channel_cache: ChannelCacheToml,

    pub cache: CacheToml,

    pub rate_limit: RateLimitToml,

    pub billing: BillingToml,

    /// Seed channels for the in-memory channel store
    pub channels: Vec<Channel>,

    /// Per-model prices
    pub pricing: HashMap<String, ModelPricing>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Everything needed to assemble a [`Gateway`](crate::gateway::Gateway)
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Channel selection
    pub selector: SelectorConfig,

    /// EMA factor for channel latency
    pub latency_alpha: f64,

    /// Channel index staleness bound
    pub channel_cache_ttl: Duration,

    /// Background channel refresh period
    pub channel_refresh_interval: Duration,

    /// User and token caches
    pub cache: CacheConfig,

    /// Admission rate limiting
    pub rate_limit: RateLimitConfig,

    /// Async billing pipeline
    pub billing: BillingConfig,

    /// Seed channels
    pub channels: Vec<Channel>,

    /// Model prices
    pub pricing: PricingTable,

    /// Redis endpoint; in-memory backends are used when unset
    pub redis_url: Option<String>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    pub(crate) source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            latency_alpha: DEFAULT_LATENCY_ALPHA,
            channel_cache_ttl: Duration::from_secs(60),
            channel_refresh_interval: Duration::from_secs(30),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            billing: BillingConfig::default(),
            channels: Vec::new(),
            pricing: PricingTable::new(),
            redis_url: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check every section for values the runtime cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.selector.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "selector.max_retries must be at least 1".into(),
            ));
        }
        if !(self.latency_alpha > 0.0 && self.latency_alpha <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "selector.latency_alpha must be in (0, 1], got {}",
                self.latency_alpha
            )));
        }
        if self.channel_cache_ttl.is_zero() || self.channel_refresh_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "channel_cache intervals must be positive".into(),
            ));
        }

        self.cache.validate().map_err(invalid)?;
        if !(self.cache.bloom_fp_rate > 0.0 && self.cache.bloom_fp_rate < 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "cache.bloom_fp_rate must be in (0, 1), got {}",
                self.cache.bloom_fp_rate
            )));
        }
        self.rate_limit.validate().map_err(invalid)?;
        self.billing.validate().map_err(invalid)?;
        self.pricing.validate().map_err(invalid)?;

        let mut ids = HashSet::new();
        for channel in &self.channels {
            channel.validate().map_err(invalid)?;
            if !ids.insert(channel.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-gateway/gateway.toml` or
/// `~/.config/llm-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-gateway").join("gateway.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// The result is not validated; call [`GatewayConfig::validate`] after
/// applying any overrides.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Parse a TOML document without touching the filesystem or environment
///
/// # Errors
///
/// Returns an error if the document does not parse.
pub fn from_toml_str(content: &str) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();
    apply_toml_config(&mut config, toml::from_str(content)?)?;
    config.source = ConfigSource::File;
    Ok(config)
}

fn apply_toml_config(config: &mut GatewayConfig, toml: GatewayToml) -> Result<(), ConfigError> {
    if toml.redis_url.is_some() {
        config.redis_url = toml.redis_url;
    }

    // Selector settings
    if let Some(ref name) = toml.selector.default_strategy {
        config.selector.default_strategy = name.parse::<Strategy>().map_err(invalid)?;
    }
    if let Some(retries) = toml.selector.max_retries {
        config.selector.max_retries = retries;
    }
    if let Some(after) = toml.selector.auto_disable_after {
        config.selector.auto_disable_after = (after > 0).then_some(after);
    }
    if let Some(alpha) = toml.selector.latency_alpha {
        config.latency_alpha = alpha;
    }

    // Channel cache settings
    if let Some(ttl) = toml.channel_cache.ttl_secs {
        config.channel_cache_ttl = Duration::from_secs(ttl);
    }
    if let Some(interval) = toml.channel_cache.refresh_interval_secs {
        config.channel_refresh_interval = Duration::from_secs(interval);
    }

    // User/token cache settings
    let cache = &toml.cache;
    if let Some(ms) = cache.l1_ttl_ms {
        config.cache.l1_ttl = Duration::from_millis(ms);
    }
    if let Some(secs) = cache.l2_ttl_secs {
        config.cache.l2_ttl = Duration::from_secs(secs);
    }
    if let Some(max) = cache.l1_max_entries {
        config.cache.l1_max_entries = max;
    }
    if let Some(enabled) = cache.bloom_enabled {
        config.cache.bloom_enabled = enabled;
    }
    if let Some(capacity) = cache.bloom_capacity {
        config.cache.bloom_capacity = capacity;
    }
    if let Some(rate) = cache.bloom_fp_rate {
        config.cache.bloom_fp_rate = rate;
    }
    if let Some(ms) = cache.op_timeout_ms {
        config.cache.op_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = cache.cleanup_interval_secs {
        config.cache.cleanup_interval = Duration::from_secs(secs);
    }
    if let Some(ref prefix) = cache.key_prefix {
        config.cache.key_prefix = prefix.clone();
    }

    // Rate limit settings
    let rl = &toml.rate_limit;
    if let Some(rate) = rl.requests_per_second {
        config.rate_limit.requests_per_second = rate;
    }
    if let Some(burst) = rl.burst_size {
        config.rate_limit.burst_size = burst;
    }
    if let Some(enabled) = rl.enabled {
        config.rate_limit.enabled = enabled;
    }
    if let Some(fail_open) = rl.fail_open {
        config.rate_limit.fail_open = fail_open;
    }
    if let Some(ref prefix) = rl.key_prefix {
        config.rate_limit.key_prefix = prefix.clone();
    }
    if let Some(ms) = rl.op_timeout_ms {
        config.rate_limit.op_timeout_ms = ms;
    }

    // Billing settings
    let billing = &toml.billing;
    if let Some(capacity) = billing.queue_capacity {
        config.billing.queue_capacity = capacity;
    }
    if let Some(consumers) = billing.consumers {
        config.billing.consumers = consumers;
    }
    if let Some(max_retry) = billing.max_retry {
        config.billing.consumer.max_retry = max_retry;
    }
    if let Some(ms) = billing.retry_delay_ms {
        config.billing.consumer.retry_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = billing.op_timeout_ms {
        config.billing.consumer.op_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = billing.dlq_capacity {
        config.billing.dlq_capacity = capacity;
    }
    if let Some(secs) = billing.stats_interval_secs {
        config.billing.stats_interval = Duration::from_secs(secs);
    }

    if !toml.channels.is_empty() {
        config.channels = toml.channels;
    }
    for (model, pricing) in toml.pricing {
        config.pricing.insert(model, pricing);
    }
    Ok(())
}

/// Apply `GATEWAY_*` variables read through `var`.
///
/// Unparseable values are ignored with a warning.
fn apply_env_config(config: &mut GatewayConfig, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
        let parsed = value.trim().parse().ok();
        if parsed.is_none() {
            tracing::warn!(var = name, value, "ignoring unparseable environment override");
        }
        parsed
    }

    if let Some(name) = var("GATEWAY_DEFAULT_STRATEGY") {
        if let Some(strategy) = parsed::<Strategy>("GATEWAY_DEFAULT_STRATEGY", &name) {
            config.selector.default_strategy = strategy;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(rate) = var("GATEWAY_RATE_LIMIT_RPS") {
        if let Some(rps) = parsed::<f64>("GATEWAY_RATE_LIMIT_RPS", &rate) {
            config.rate_limit.requests_per_second = rps;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(burst) = var("GATEWAY_RATE_LIMIT_BURST") {
        if let Some(b) = parsed::<u32>("GATEWAY_RATE_LIMIT_BURST", &burst) {
            config.rate_limit.burst_size = b;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(consumers) = var("GATEWAY_BILLING_CONSUMERS") {
        if let Some(n) = parsed::<usize>("GATEWAY_BILLING_CONSUMERS", &consumers) {
            config.billing.consumers = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(ttl) = var("GATEWAY_L1_TTL_MS") {
        if let Some(ms) = parsed::<u64>("GATEWAY_L1_TTL_MS", &ttl) {
            config.cache.l1_ttl = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(ttl) = var("GATEWAY_L2_TTL_SECS") {
        if let Some(secs) = parsed::<u64>("GATEWAY_L2_TTL_SECS", &ttl) {
            config.cache.l2_ttl = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(url) = var("GATEWAY_REDIS_URL") {
        if !url.trim().is_empty() {
            config.redis_url = Some(url);
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// Programmatic Overrides
// =============================================================================

/// Builder for overrides applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default strategy override
    pub default_strategy: Option<Strategy>,

    /// Rate limit enabled override
    pub rate_limit_enabled: Option<bool>,

    /// Billing consumer count override
    pub billing_consumers: Option<usize>,

    /// Redis URL override
    pub redis_url: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_rate_limit_enabled(mut self, enabled: bool) -> Self {
        self.rate_limit_enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_billing_consumers(mut self, consumers: usize) -> Self {
        self.billing_consumers = Some(consumers);
        self
    }

    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.default_strategy.is_some()
            || self.rate_limit_enabled.is_some()
            || self.billing_consumers.is_some()
            || self.redis_url.is_some()
        {
            config.source = ConfigSource::Override;
        }

        if let Some(strategy) = self.default_strategy {
            config.selector.default_strategy = strategy;
        }
        if let Some(enabled) = self.rate_limit_enabled {
            config.rate_limit.enabled = enabled;
        }
        if let Some(consumers) = self.billing_consumers {
            config.billing.consumers = consumers;
        }
        if let Some(ref url) = self.redis_url {
            config.redis_url = Some(url.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
