//! Message-broker backed billing queue
//!
//! [`BillingTransport`] is the publish/consume/ack/nack surface of a broker
//! (AMQP-style named queues). [`TransportEventQueue`] adapts it to
//! [`EventQueue`] with JSON payloads; [`InMemoryTransport`] stands in for the
//! broker in tests and single-node deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::event::BillingEvent;
use super::queue::EventQueue;
use crate::error::{GatewayError, Result};
use crate::metrics::{Counter, Gauge};

/// Default broker queue for billing events
pub const DEFAULT_BILLING_QUEUE: &str = "billing.events";

/// One delivered message awaiting ack or nack
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

/// Broker operations the billing queue needs
#[async_trait]
pub trait BillingTransport: Send + Sync {
    /// Publish a payload to `queue`
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()>;

    /// Wait for the next message on `queue`; `Ok(None)` once `cancel` fires
    async fn consume(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<Delivery>>;

    /// Confirm processing
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject; `requeue` puts the message back at the head of its queue
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

// ============================================================================
// TransportEventQueue
// ============================================================================

/// [`EventQueue`] over a [`BillingTransport`].
///
/// Messages are acked as soon as they decode, so retries are re-published
/// rather than redelivered. Payloads that do not decode are nacked without
/// requeue.
pub struct TransportEventQueue {
    transport: Arc<dyn BillingTransport>,
    queue: String,
    depth: Gauge,
    discarded: Counter,
    malformed: Counter,
    reconnect_base: Duration,
}

impl std::fmt::Debug for TransportEventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEventQueue")
            .field("queue", &self.queue)
            .field("depth", &self.depth.get())
            .finish_non_exhaustive()
    }
}

impl TransportEventQueue {
    pub fn new(transport: Arc<dyn BillingTransport>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
            depth: Gauge::new(),
            discarded: Counter::new(),
            malformed: Counter::new(),
            reconnect_base: Duration::from_millis(100),
        }
    }

    /// Base delay between consume attempts after a broker error
    #[must_use]
    pub fn with_reconnect_base(mut self, base: Duration) -> Self {
        self.reconnect_base = base;
        self
    }

    /// Messages dropped because they did not decode
    pub fn malformed_count(&self) -> u64 {
        self.malformed.get()
    }

    async fn settle(&self, delivery: &Delivery) -> Option<BillingEvent> {
        match serde_json::from_slice::<BillingEvent>(&delivery.payload) {
            Ok(event) => {
                if let Err(e) = self.transport.ack(delivery.delivery_tag).await {
                    tracing::warn!(queue = %self.queue, error = %e, "billing ack failed");
                }
                Some(event)
            }
            Err(e) => {
                self.malformed.inc();
                tracing::warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "dropping malformed billing message"
                );
                if let Err(e) = self.transport.nack(delivery.delivery_tag, false).await {
                    tracing::warn!(queue = %self.queue, error = %e, "billing nack failed");
                }
                None
            }
        }
    }
}

#[async_trait]
impl EventQueue for TransportEventQueue {
    async fn enqueue(&self, event: BillingEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event)?;
        match self.transport.publish(&self.queue, payload).await {
            Ok(()) => {
                self.depth.inc();
                Ok(())
            }
            Err(e @ GatewayError::CapacityExceeded(_)) => {
                self.discarded.inc();
                tracing::warn!(event_id = %event.event_id, queue = %self.queue, "billing queue full, event discarded");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Option<BillingEvent> {
        let mut failures: u32 = 0;
        loop {
            match self.transport.consume(&self.queue, cancel).await {
                Ok(Some(delivery)) => {
                    failures = 0;
                    self.depth.dec();
                    if let Some(event) = self.settle(&delivery).await {
                        return Some(event);
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    // exponential backoff, capped at 32x the base
                    let backoff = self.reconnect_base * (1u32 << failures.min(5));
                    failures = failures.saturating_add(1);
                    tracing::warn!(queue = %self.queue, error = %e, ?backoff, "billing consume failed");
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn len(&self) -> usize {
        usize::try_from(self.depth.get()).unwrap_or(0)
    }

    fn discard_count(&self) -> u64 {
        self.discarded.get()
    }
}

// ============================================================================
// InMemoryTransport
// ============================================================================

#[derive(Debug, Default)]
struct Broker {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
}

/// Process-local broker with per-queue length limits
#[derive(Debug)]
pub struct InMemoryTransport {
    broker: Mutex<Broker>,
    max_length: usize,
    next_tag: AtomicU64,
    notify: Notify,
}

impl InMemoryTransport {
    /// Broker whose queues reject publishes beyond `max_length` messages
    pub fn new(max_length: usize) -> Self {
        Self {
            broker: Mutex::new(Broker::default()),
            max_length: max_length.max(1),
            next_tag: AtomicU64::new(1),
            notify: Notify::new(),
        }
    }

    /// Ready messages in `queue`
    pub fn ready(&self, queue: &str) -> usize {
        self.broker.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Delivered but not yet acked or nacked
    pub fn unacked(&self) -> usize {
        self.broker.lock().unacked.len()
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut broker = self.broker.lock();
        let payload = broker.queues.get_mut(queue)?.pop_front()?;
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        broker
            .unacked
            .insert(delivery_tag, (queue.to_owned(), payload.clone()));
        Some(Delivery {
            delivery_tag,
            payload,
        })
    }
}

#[async_trait]
impl BillingTransport for InMemoryTransport {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        {
            let mut broker = self.broker.lock();
            let ready = broker.queues.entry(queue.to_owned()).or_default();
            if ready.len() >= self.max_length {
                return Err(GatewayError::CapacityExceeded(format!(
                    "queue {queue} at max length {}",
                    self.max_length
                )));
            }
            ready.push_back(payload);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = &mut notified => {}
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.broker
            .lock()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("delivery {delivery_tag}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        {
            let mut broker = self.broker.lock();
            let (queue, payload) = broker
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| GatewayError::NotFound(format!("delivery {delivery_tag}")))?;
            if !requeue {
                return Ok(());
            }
            broker.queues.entry(queue).or_default().push_front(payload);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
