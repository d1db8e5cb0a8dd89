//! Billing consumer
//!
//! Pulls events off the queue and debits quota. Every processing failure is
//! absorbed here:
//!
//! ```text
//! price ──(no pricing)──────────────────────────> DLQ (invalid_pricing)
//!   │
//!   v
//! deduct ──(QuotaExhausted)─────────────────────> DLQ (quota_exhausted)
//!   │    ──(other error, retries left)──> wait retry_delay ──> re-enqueue
//!   │    ──(other error, no retries left)───────> DLQ (retries_exhausted)
//!   v
//! stats + cached quota sync
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::dlq::{DeadLetterKind, DeadLetterQueue};
use super::event::{BillingEvent, PricingTable};
use super::queue::EventQueue;
use crate::cache::CacheManager;
use crate::error::GatewayError;
use crate::metrics::Counter;
use crate::routing::StatsTracker;
use crate::store::QuotaLedger;

// ============================================================================
// Configuration and Statistics
// ============================================================================

/// Retry behaviour of a consumer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Retries after the first failed attempt
    pub max_retry: u32,
    /// Fixed wait before each re-enqueue
    pub retry_delay: Duration,
    /// Bound on one quota debit
    pub op_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_delay: Duration::from_secs(1),
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters shared by every consumer of a service
#[derive(Debug, Default)]
pub struct BillingStats {
    pub processed: Counter,
    pub succeeded: Counter,
    pub retried: Counter,
    pub dead_lettered: Counter,
    /// Quota debited in total
    pub debited: Counter,
}

/// Point-in-time copy of [`BillingStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BillingStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub debited: u64,
}

impl BillingStats {
    pub fn snapshot(&self) -> BillingStatsSnapshot {
        BillingStatsSnapshot {
            processed: self.processed.get(),
            succeeded: self.succeeded.get(),
            retried: self.retried.get(),
            dead_lettered: self.dead_lettered.get(),
            debited: self.debited.get(),
        }
    }
}

/// What happened to one event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Quota debited
    Completed {
        /// Balance after the debit
        remaining: i64,
    },
    /// Scheduled for another attempt
    Retrying {
        /// Retry number about to be made
        attempt: u32,
    },
    /// Moved to the dead-letter queue
    DeadLettered(DeadLetterKind),
}

// ============================================================================
// Retry Scheduler
// ============================================================================

/// Delayed re-enqueue timers.
///
/// Cancelling the scheduler fires every pending timer at once so the events
/// land back in the queue instead of vanishing with the task.
#[derive(Debug)]
pub struct RetryScheduler {
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Re-enqueue `event` after `retry_delay`, or immediately on shutdown.
    /// Must be called from within a Tokio runtime.
    pub fn schedule(
        &self,
        event: BillingEvent,
        retry_delay: Duration,
        queue: Arc<dyn EventQueue>,
        dlq: Arc<DeadLetterQueue>,
    ) {
        let cancel = self.cancel.clone();
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(retry_delay) => {}
            }
            if let Err(e) = queue.enqueue(event.clone()).await {
                dlq.push(event, DeadLetterKind::QueueFull, format!("retry re-enqueue failed: {e}"));
            }
        });
    }

    /// Timers not yet fired
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Fire every pending timer now and wait until each event is re-enqueued
    pub async fn flush(&self) {
        self.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Everything a consumer needs, shared across a service's consumers
#[derive(Clone)]
pub struct BillingContext {
    pub queue: Arc<dyn EventQueue>,
    pub dlq: Arc<DeadLetterQueue>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub pricing: Arc<PricingTable>,
    pub channel_stats: Option<Arc<StatsTracker>>,
    pub cache: Option<Arc<CacheManager>>,
    pub retries: Arc<RetryScheduler>,
    pub stats: Arc<BillingStats>,
    pub config: ConsumerConfig,
}

impl std::fmt::Debug for BillingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingContext")
            .field("queued", &self.queue.len())
            .field("dead_letters", &self.dlq.size())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BillingContext {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        dlq: Arc<DeadLetterQueue>,
        ledger: Arc<dyn QuotaLedger>,
        pricing: PricingTable,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            dlq,
            ledger,
            pricing: Arc::new(pricing),
            channel_stats: None,
            cache: None,
            retries: Arc::new(RetryScheduler::new()),
            stats: Arc::new(BillingStats::default()),
            config,
        }
    }

    /// Feed successful latencies into channel statistics
    #[must_use]
    pub fn with_channel_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.channel_stats = Some(stats);
        self
    }

    /// Push the new balance into the user cache after each debit
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// One queue worker
#[derive(Debug)]
pub struct Consumer {
    id: usize,
    ctx: BillingContext,
}

impl Consumer {
    pub fn new(id: usize, ctx: BillingContext) -> Self {
        Self { id, ctx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process events until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(consumer = self.id, "billing consumer started");
        while let Some(event) = self.ctx.queue.dequeue(&cancel).await {
            self.process_event(event).await;
        }
        tracing::info!(consumer = self.id, "billing consumer stopped");
    }

    /// Price and debit one event
    pub async fn process_event(&self, event: BillingEvent) -> EventOutcome {
        let ctx = &self.ctx;
        ctx.stats.processed.inc();

        let cost = match ctx.pricing.price(&event) {
            Ok(cost) => cost,
            Err(e) => return self.dead_letter(event, DeadLetterKind::InvalidPricing, e.to_string()),
        };

        let timeout = ctx.config.op_timeout;
        // retries reuse the event id, so a debit that landed before a timeout is not repeated
        let debit = ctx.ledger.deduct(event.event_id, event.user_id, cost);
        let deducted = match tokio::time::timeout(timeout, debit).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout("quota deduct", timeout)),
        };

        match deducted {
            Ok(remaining) => {
                self.complete(&event, cost, remaining).await;
                EventOutcome::Completed { remaining }
            }
            Err(e @ GatewayError::QuotaExhausted { .. }) => {
                self.dead_letter(event, DeadLetterKind::QuotaExhausted, e.to_string())
            }
            Err(e) if event.retry_count < ctx.config.max_retry => {
                let mut event = event;
                event.retry_count += 1;
                let attempt = event.retry_count;
                tracing::warn!(
                    consumer = self.id,
                    event_id = %event.event_id,
                    user_id = event.user_id,
                    attempt,
                    error = %e,
                    "billing debit failed, retrying"
                );
                ctx.stats.retried.inc();
                ctx.retries.schedule(
                    event,
                    ctx.config.retry_delay,
                    Arc::clone(&ctx.queue),
                    Arc::clone(&ctx.dlq),
                );
                EventOutcome::Retrying { attempt }
            }
            Err(e) => {
                let reason = format!("{e} (after {} retries)", event.retry_count);
                self.dead_letter(event, DeadLetterKind::RetriesExhausted, reason)
            }
        }
    }

    async fn complete(&self, event: &BillingEvent, cost: i64, remaining: i64) {
        let ctx = &self.ctx;
        if let (Some(tracker), Some(channel_id), Some(latency_ms)) =
            (&ctx.channel_stats, event.channel_id, event.latency_ms)
        {
            tracker.record_success(channel_id, Duration::from_millis(latency_ms));
        }
        if let Some(cache) = &ctx.cache {
            if let Err(e) = cache.sync_user_quota(event.user_id, remaining).await {
                tracing::warn!(user_id = event.user_id, error = %e, "cached quota sync failed");
            }
        }
        ctx.stats.debited.add(u64::try_from(cost).unwrap_or(0));
        ctx.stats.succeeded.inc();

        tracing::debug!(
            consumer = self.id,
            event_id = %event.event_id,
            user_id = event.user_id,
            model = %event.model,
            cost,
            remaining,
            "billing event settled"
        );
    }

    fn dead_letter(&self, event: BillingEvent, kind: DeadLetterKind, reason: String) -> EventOutcome {
        self.ctx.stats.dead_lettered.inc();
        self.ctx.dlq.push(event, kind, reason);
        EventOutcome::DeadLettered(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::event::ModelPricing;
    use crate::billing::queue::BillingEventQueue;
    use crate::error::Result;
    use crate::store::{InMemoryStore, UserRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Ledger that fails with a transient error a fixed number of times.
    /// While `stalls_left` is non-zero a call applies the debit and then
    /// hangs past the consumer's timeout.
    struct FlakyLedger {
        inner: InMemoryStore,
        failures_left: AtomicU32,
        stalls_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl QuotaLedger for FlakyLedger {
        async fn deduct(&self, debit_id: uuid::Uuid, user_id: i64, amount: i64) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(GatewayError::Transient("ledger unavailable".into()));
            }
            let balance = self.inner.deduct(debit_id, user_id, amount).await?;
            let stalls = self.stalls_left.load(Ordering::SeqCst);
            if stalls > 0 {
                self.stalls_left.store(stalls - 1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(balance)
        }
    }

    fn ledger(quota: i64, failures: u32) -> Arc<FlakyLedger> {
        let inner = InMemoryStore::new();
        inner.put_user(UserRecord::new(1, "alice", quota));
        Arc::new(FlakyLedger {
            inner,
            failures_left: AtomicU32::new(failures),
            stalls_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }

    fn consumer(ledger: Arc<FlakyLedger>, max_retry: u32) -> (Consumer, Arc<BillingEventQueue>) {
        let queue = Arc::new(BillingEventQueue::new(16));
        let ctx = BillingContext::new(
            queue.clone(),
            Arc::new(DeadLetterQueue::new(16)),
            ledger,
            PricingTable::new().with_model("gpt-4o", ModelPricing::new(1000.0, 1000.0)),
            ConsumerConfig {
                max_retry,
                retry_delay: Duration::from_secs(2),
                op_timeout: Duration::from_secs(1),
            },
        )
        .with_channel_stats(Arc::new(StatsTracker::default()));
        (Consumer::new(0, ctx), queue)
    }

    #[tokio::test]
    async fn test_success_debits_and_records_latency() {
        let ledger = ledger(100, 0);
        let (consumer, _) = consumer(ledger.clone(), 3);
        let event = BillingEvent::new(1, "gpt-4o", 10, 20).with_channel(4, 250);

        let outcome = consumer.process_event(event).await;
        assert_eq!(outcome, EventOutcome::Completed { remaining: 70 });
        assert_eq!(ledger.inner.quota(1), Some(70));

        let tracker = consumer.ctx.channel_stats.as_ref().unwrap();
        assert_eq!(tracker.average_latency(4), Some(250.0));
        assert_eq!(consumer.ctx.stats.snapshot().debited, 30);
    }

    #[tokio::test]
    async fn test_quota_exhausted_dead_letters_without_retry() {
        let ledger = ledger(10, 0);
        let (consumer, queue) = consumer(ledger.clone(), 3);
        let before = consumer.ctx.dlq.size();

        let outcome = consumer
            .process_event(BillingEvent::new(1, "gpt-4o", 0, 0).with_cost(100))
            .await;

        assert_eq!(outcome, EventOutcome::DeadLettered(DeadLetterKind::QuotaExhausted));
        assert_eq!(consumer.ctx.dlq.size(), before + 1);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.ctx.retries.pending(), 0);
        assert!(queue.is_empty());
        assert_eq!(ledger.inner.quota(1), Some(10));
    }

    #[tokio::test]
    async fn test_unpriced_model_dead_letters() {
        let (consumer, _) = consumer(ledger(100, 0), 3);
        let outcome = consumer.process_event(BillingEvent::new(1, "mystery", 5, 5)).await;
        assert_eq!(outcome, EventOutcome::DeadLettered(DeadLetterKind::InvalidPricing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_then_dead_letters() {
        let ledger = ledger(100, u32::MAX);
        let (consumer, queue) = consumer(ledger.clone(), 2);
        let cancel = CancellationToken::new();

        let mut event = BillingEvent::new(1, "gpt-4o", 1, 1);
        for attempt in 1..=2 {
            let outcome = consumer.process_event(event).await;
            assert_eq!(outcome, EventOutcome::Retrying { attempt });
            assert!(queue.is_empty());

            let started = tokio::time::Instant::now();
            event = queue.dequeue(&cancel).await.unwrap();
            assert!(started.elapsed() >= Duration::from_secs(2));
            assert_eq!(event.retry_count, attempt);
        }

        let outcome = consumer.process_event(event).await;
        assert_eq!(outcome, EventOutcome::DeadLettered(DeadLetterKind::RetriesExhausted));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
        assert_eq!(consumer.ctx.stats.snapshot().retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let ledger = ledger(100, 1);
        let (consumer, queue) = consumer(ledger.clone(), 3);
        let cancel = CancellationToken::new();

        let first = consumer.process_event(BillingEvent::new(1, "gpt-4o", 1, 1)).await;
        assert_eq!(first, EventOutcome::Retrying { attempt: 1 });
        let event = queue.dequeue(&cancel).await.unwrap();
        let second = consumer.process_event(event).await;
        assert!(matches!(second, EventOutcome::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_timed_out_debit_is_not_charged_twice() {
        let ledger = ledger(100, 0);
        ledger.stalls_left.store(1, Ordering::SeqCst);
        let (consumer, queue) = consumer(ledger.clone(), 3);
        let cancel = CancellationToken::new();

        let first = consumer.process_event(BillingEvent::new(1, "gpt-4o", 10, 20)).await;
        assert_eq!(first, EventOutcome::Retrying { attempt: 1 });
        assert_eq!(ledger.inner.quota(1), Some(70));

        let event = queue.dequeue(&cancel).await.unwrap();
        let second = consumer.process_event(event).await;
        assert_eq!(second, EventOutcome::Completed { remaining: 70 });
        assert_eq!(ledger.inner.quota(1), Some(70));
        assert_eq!(ledger.inner.settled_debits(), 1);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_requeues_pending_retries_immediately() {
        let (consumer, queue) = consumer(ledger(100, 1), 3);
        consumer.process_event(BillingEvent::new(1, "gpt-4o", 1, 1)).await;
        assert_eq!(consumer.ctx.retries.pending(), 1);

        let started = tokio::time::Instant::now();
        consumer.ctx.retries.flush().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(queue.len(), 1);
        assert_eq!(consumer.ctx.retries.pending(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_until_cancelled() {
        let ledger = ledger(1_000, 0);
        let (consumer, queue) = consumer(ledger.clone(), 3);
        for _ in 0..5 {
            queue.try_enqueue(BillingEvent::new(1, "gpt-4o", 0, 0).with_cost(10)).unwrap();
        }

        let cancel = CancellationToken::new();
        let consumer = Arc::new(consumer);
        let worker = {
            let consumer = Arc::clone(&consumer);
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        while consumer.ctx.stats.snapshot().succeeded < 5 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(ledger.inner.quota(1), Some(950));
    }
}
