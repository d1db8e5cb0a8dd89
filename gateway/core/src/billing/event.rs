//! Billing events and model pricing

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::routing::ChannelId;

/// Usage of one completed request, waiting to be debited
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub event_id: Uuid,
    pub user_id: i64,
    #[serde(default)]
    pub token_id: Option<i64>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Quota to debit; zero means "price from token counts"
    #[serde(default)]
    pub cost: i64,
    pub request_id: String,
    /// Upstream latency of the request, when known
    #[serde(default)]
    pub latency_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl BillingEvent {
    /// Unpriced event with fresh event and request ids
    pub fn new(
        user_id: i64,
        model: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id,
            token_id: None,
            channel_id: None,
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            cost: 0,
            request_id: Uuid::new_v4().to_string(),
            latency_ms: None,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Fix the debit instead of pricing from token counts
    #[must_use]
    pub fn with_cost(mut self, cost: i64) -> Self {
        self.cost = cost;
        self
    }

    /// Record which channel served the request and how long it took
    #[must_use]
    pub fn with_channel(mut self, channel_id: ChannelId, latency_ms: u64) -> Self {
        self.channel_id = Some(channel_id);
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Record the API token used
    #[must_use]
    pub fn with_token(mut self, token_id: i64) -> Self {
        self.token_id = Some(token_id);
        self
    }

    /// Correlate with an existing request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ============================================================================
// Pricing
// ============================================================================

/// Quota charged per 1000 tokens
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Cost of a request, rounded up to whole quota units
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> i64 {
        let raw = (prompt_tokens as f64 * self.input_per_1k
            + completion_tokens as f64 * self.output_per_1k)
            / 1000.0;
        raw.ceil() as i64
    }
}

/// Prices by model name
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model's price
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.insert(model, pricing);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.models.insert(model.into(), pricing);
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Amount to debit for `event`.
    ///
    /// A positive `cost` on the event wins; otherwise the model's price is
    /// applied to the token counts. Negative costs and unpriced models are
    /// `Config` errors.
    pub fn price(&self, event: &BillingEvent) -> Result<i64> {
        if event.cost > 0 {
            return Ok(event.cost);
        }
        if event.cost < 0 {
            return Err(GatewayError::Config(format!(
                "event {} has negative cost {}",
                event.event_id, event.cost
            )));
        }
        let pricing = self.get(&event.model).ok_or_else(|| {
            GatewayError::Config(format!("no pricing for model {}", event.model))
        })?;
        Ok(pricing.cost(event.prompt_tokens, event.completion_tokens))
    }

    /// Reject negative or non-finite prices
    pub fn validate(&self) -> Result<()> {
        for (model, pricing) in &self.models {
            let valid = |p: f64| p.is_finite() && p >= 0.0;
            if !valid(pricing.input_per_1k) || !valid(pricing.output_per_1k) {
                return Err(GatewayError::Config(format!(
                    "pricing for {model} must be non-negative"
                )));
            }
        }
        Ok(())
    }
}
