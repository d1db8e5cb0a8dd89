//! Relay Interfaces
//!
//! The gateway does not speak any vendor protocol itself. A [`RelayHandler`]
//! forwards a request to the channel the selector picked and reports token
//! usage back for billing. The selector only needs the channel's connection
//! info, so one handler can serve every capability of a vendor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::routing::Channel;

/// The kind of upstream call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Embedding,
    Image,
    Audio,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Embedding => "embedding",
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request after admission
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub model: String,
    /// Vendor-neutral request body
    pub body: serde_json::Value,
    /// Client asked for a streamed response
    #[serde(default)]
    pub stream: bool,
    /// Correlates logs, upstream calls and the billing event
    pub request_id: String,
}

impl RelayRequest {
    /// Non-streaming request with a fresh request id
    pub fn new(model: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            body,
            stream: false,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Token counts reported by the upstream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A complete upstream response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub body: serde_json::Value,
    pub usage: Usage,
}

/// Forwards admitted requests to an upstream channel.
///
/// Errors should be `Transient` when another channel might succeed; the
/// selector retries those on the next candidate.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// Perform a unary call
    async fn handle(
        &self,
        channel: &Channel,
        capability: Capability,
        request: &RelayRequest,
    ) -> Result<RelayResponse>;

    /// Stream response chunks into `chunks`, returning the final usage.
    ///
    /// Handlers without streaming support keep the default, which refuses.
    async fn handle_stream(
        &self,
        channel: &Channel,
        capability: Capability,
        request: &RelayRequest,
        chunks: mpsc::Sender<String>,
    ) -> Result<Usage> {
        let _ = (channel, request, chunks);
        Err(GatewayError::Config(format!(
            "streaming {capability} is not supported by this relay"
        )))
    }
}
