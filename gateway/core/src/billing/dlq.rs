//! Dead-letter queue
//!
//! Bounded ring buffer of events that will not be processed again without
//! operator action. When full, the oldest entry is evicted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::event::BillingEvent;
use crate::metrics::Counter;

/// Why an event was dead-lettered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// The user's balance could not cover the debit
    QuotaExhausted,
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
    /// The event could not be priced
    InvalidPricing,
    /// A retry could not be re-enqueued
    QueueFull,
}

/// A dead-lettered event with its cause
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: BillingEvent,
    pub kind: DeadLetterKind,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    pushed: Counter,
    evicted: Counter,
}

impl DeadLetterQueue {
    /// Ring buffer of `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            pushed: Counter::new(),
            evicted: Counter::new(),
        }
    }

    /// Store `event`; returns the entry evicted to make room, if any
    pub fn push(
        &self,
        event: BillingEvent,
        kind: DeadLetterKind,
        reason: impl Into<String>,
    ) -> Option<DeadLetter> {
        let letter = DeadLetter {
            event,
            kind,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        };
        tracing::error!(
            event_id = %letter.event.event_id,
            user_id = letter.event.user_id,
            kind = ?letter.kind,
            reason = %letter.reason,
            "billing event dead-lettered"
        );

        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(letter);
            evicted
        };
        self.pushed.inc();
        if let Some(old) = &evicted {
            self.evicted.inc();
            tracing::warn!(event_id = %old.event.event_id, "dead-letter queue full, oldest entry evicted");
        }
        evicted
    }

    /// Entries currently held
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of every entry, oldest first
    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return every entry, oldest first
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }

    /// Entries dropped to make room
    pub fn evicted_count(&self) -> u64 {
        self.evicted.get()
    }

    /// Entries ever pushed
    pub fn total_count(&self) -> u64 {
        self.pushed.get()
    }
}
