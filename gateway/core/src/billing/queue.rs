//! Bounded billing event queue
//!
//! `enqueue` never waits: a full queue rejects the event with
//! `CapacityExceeded` and bumps the discard counter. `dequeue` parks until an
//! event arrives or the cancellation token fires.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::event::BillingEvent;
use crate::error::{GatewayError, Result};
use crate::metrics::Counter;

/// Queue of pending billing events
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append an event without waiting for space
    async fn enqueue(&self, event: BillingEvent) -> Result<()>;

    /// Next event, or `None` once `cancel` fires
    async fn dequeue(&self, cancel: &CancellationToken) -> Option<BillingEvent>;

    /// Events currently waiting
    fn len(&self) -> usize;

    /// Whether nothing is waiting
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events rejected because the queue was full
    fn discard_count(&self) -> u64;
}

/// In-process bounded FIFO
#[derive(Debug)]
pub struct BillingEventQueue {
    items: Mutex<VecDeque<BillingEvent>>,
    capacity: usize,
    notify: Notify,
    enqueued: Counter,
    discarded: Counter,
}

impl BillingEventQueue {
    /// Queue holding at most `capacity` events (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            enqueued: Counter::new(),
            discarded: Counter::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events accepted since creation
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.get()
    }

    /// Synchronous append, usable outside async contexts
    pub fn try_enqueue(&self, event: BillingEvent) -> Result<()> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                drop(items);
                self.discarded.inc();
                tracing::warn!(
                    event_id = %event.event_id,
                    user_id = event.user_id,
                    capacity = self.capacity,
                    "billing queue full, event discarded"
                );
                return Err(GatewayError::CapacityExceeded(format!(
                    "billing queue full ({} events)",
                    self.capacity
                )));
            }
            items.push_back(event);
        }
        self.enqueued.inc();
        self.notify.notify_one();
        Ok(())
    }

    /// Pop without waiting
    pub fn try_dequeue(&self) -> Option<BillingEvent> {
        self.items.lock().pop_front()
    }
}

#[async_trait]
impl EventQueue for BillingEventQueue {
    async fn enqueue(&self, event: BillingEvent) -> Result<()> {
        self.try_enqueue(event)
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Option<BillingEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent enqueue cannot slip between
            notified.as_mut().enable();

            if let Some(event) = self.try_dequeue() {
                return Some(event);
            }

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = &mut notified => {}
            }
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn discard_count(&self) -> u64 {
        self.discarded.get()
    }
}
