//! Asynchronous Billing
//!
//! ```text
//!  request done
//!       |
//!       v  enqueue (never blocks; full => CapacityExceeded + discard_count)
//! +-------------+      +-----------+      +-------------+
//! | EventQueue  | ---> | Consumer  | ---> | QuotaLedger |
//! +-------------+      +-----------+      +-------------+
//!       ^                |      |
//!       |  retry_delay   |      | quota exhausted / retries exhausted
//!       +----------------+      v
//!                        +-----------------+
//!                        | DeadLetterQueue |
//!                        +-----------------+
//! ```
//!
//! Admission already refused users without quota, so this path only
//! finalises the debit and never fails a request.

pub mod consumer;
pub mod dlq;
pub mod event;
pub mod queue;
pub mod service;
pub mod transport;

pub use consumer::{
    BillingContext, BillingStats, BillingStatsSnapshot, Consumer, ConsumerConfig, EventOutcome,
    RetryScheduler,
};
pub use dlq::{DeadLetter, DeadLetterKind, DeadLetterQueue};
pub use event::{BillingEvent, ModelPricing, PricingTable};
pub use queue::{BillingEventQueue, EventQueue};
pub use service::{AsyncBillingService, BillingConfig};
pub use transport::{
    BillingTransport, Delivery, InMemoryTransport, TransportEventQueue, DEFAULT_BILLING_QUEUE,
};
