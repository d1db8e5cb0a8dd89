//! Channel definitions
//!
//! A channel is one configured upstream vendor endpoint. The gateway only
//! reads channels; creation and editing belong to the admin surface, which
//! writes to whatever backs [`ChannelStore`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Channel primary key
pub type ChannelId = u64;

// ============================================================================
// Channel
// ============================================================================

/// An upstream endpoint plus its routing metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Primary key
    pub id: ChannelId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Vendor base URL
    #[serde(default)]
    pub base_url: String,
    /// Upstream credential
    #[serde(default, skip_serializing)]
    pub key: String,
    /// Relative share for weighted selection
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Higher wins under the priority strategy
    #[serde(default)]
    pub priority: i64,
    /// Disabled channels are never routed to
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Models this channel serves
    pub models: Vec<String>,
    /// User groups allowed to use the channel; empty means every group
    #[serde(default)]
    pub groups: Vec<String>,
    /// Last measured response time, used when no live stats exist
    #[serde(default)]
    pub response_time_ms: Option<u64>,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    /// Enabled channel with weight 1 and priority 0
    pub fn new(id: ChannelId, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id,
            name: format!("channel-{id}"),
            base_url: String::new(),
            key: String::new(),
            weight: 1,
            priority: 0,
            enabled: true,
            models: models.into_iter().map(Into::into).collect(),
            groups: Vec::new(),
            response_time_ms: None,
        }
    }

    /// Set the weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Restrict to user groups
    #[must_use]
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Set the static response-time hint
    #[must_use]
    pub fn with_response_time_ms(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Set the upstream endpoint
    #[must_use]
    pub fn with_endpoint(mut self, base_url: impl Into<String>, key: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self.key = key.into();
        self
    }

    /// Whether this channel serves `model`
    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Whether a user in `group` may use this channel
    pub fn serves_group(&self, group: &str) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| g == group)
    }

    /// Reject obviously broken definitions
    pub fn validate(&self) -> Result<()> {
        if self.models.iter().all(|m| m.trim().is_empty()) {
            return Err(GatewayError::Config(format!(
                "channel {} lists no models",
                self.id
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Channel Store
// ============================================================================

/// Authoritative source of channel definitions
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Every enabled channel
    async fn load_enabled(&self) -> Result<Vec<Channel>>;
}

/// Channel store backed by a vector; handy for config-seeded deployments
#[derive(Debug, Default)]
pub struct InMemoryChannelStore {
    channels: RwLock<Vec<Channel>>,
}

impl InMemoryChannelStore {
    /// Store holding `channels`
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }

    /// Insert or replace by id
    pub fn upsert(&self, channel: Channel) {
        let mut channels = self.channels.write();
        match channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => *existing = channel,
            None => channels.push(channel),
        }
    }

    /// Flip the enabled flag; returns false if the id is unknown
    pub fn set_enabled(&self, id: ChannelId, enabled: bool) -> bool {
        let mut channels = self.channels.write();
        match channels.iter_mut().find(|c| c.id == id) {
            Some(channel) => {
                channel.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChannelStore for InMemoryChannelStore {
    async fn load_enabled(&self) -> Result<Vec<Channel>> {
        Ok(self
            .channels
            .read()
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }
}
