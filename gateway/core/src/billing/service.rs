//! Async billing service
//!
//! Owns the queue, the dead-letter queue and a pool of consumers, and ties
//! their lifetime to `start`/`stop`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::consumer::{
    BillingContext, BillingStatsSnapshot, Consumer, ConsumerConfig, RetryScheduler,
};
use super::dlq::{DeadLetterKind, DeadLetterQueue};
use super::event::{BillingEvent, PricingTable};
use super::queue::{BillingEventQueue, EventQueue};
use crate::cache::CacheManager;
use crate::error::{GatewayError, Result};
use crate::routing::StatsTracker;
use crate::store::QuotaLedger;
use crate::task::PeriodicTask;

/// Sizing and timing of the billing pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Bound of the in-memory queue
    pub queue_capacity: usize,
    /// Concurrent consumers
    pub consumers: usize,
    /// Dead-letter ring buffer size
    pub dlq_capacity: usize,
    /// Retry behaviour
    pub consumer: ConsumerConfig,
    /// How often queue and DLQ sizes are logged
    pub stats_interval: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            consumers: 4,
            dlq_capacity: 1_000,
            consumer: ConsumerConfig::default(),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl BillingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 || self.dlq_capacity == 0 {
            return Err(GatewayError::Config(
                "billing queue and dead-letter capacities must be positive".into(),
            ));
        }
        if self.consumers == 0 {
            return Err(GatewayError::Config("billing needs at least one consumer".into()));
        }
        Ok(())
    }
}

struct Running {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    retries: Arc<RetryScheduler>,
    ticker: PeriodicTask,
}

/// Queue + consumers + dead-letter queue
pub struct AsyncBillingService {
    ctx: BillingContext,
    config: BillingConfig,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for AsyncBillingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBillingService")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("queued", &self.ctx.queue.len())
            .finish_non_exhaustive()
    }
}

impl AsyncBillingService {
    /// Service over an in-memory queue
    pub fn new(config: BillingConfig, ledger: Arc<dyn QuotaLedger>, pricing: PricingTable) -> Result<Self> {
        let queue = Arc::new(BillingEventQueue::new(config.queue_capacity));
        Self::with_queue(config, queue, ledger, pricing)
    }

    /// Service over any [`EventQueue`], e.g. a broker-backed one
    pub fn with_queue(
        config: BillingConfig,
        queue: Arc<dyn EventQueue>,
        ledger: Arc<dyn QuotaLedger>,
        pricing: PricingTable,
    ) -> Result<Self> {
        config.validate()?;
        pricing.validate()?;
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq_capacity));
        let ctx = BillingContext::new(queue, dlq, ledger, pricing, config.consumer.clone());
        Ok(Self {
            ctx,
            config,
            running: Mutex::new(None),
        })
    }

    /// Report successful request latencies to channel statistics
    #[must_use]
    pub fn with_channel_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.ctx.channel_stats = Some(stats);
        self
    }

    /// Keep cached user quota in step with debits
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.ctx.cache = Some(cache);
        self
    }

    /// Spawn the consumers and the stats ticker
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(GatewayError::Config("billing service already running".into()));
        }

        let cancel = CancellationToken::new();
        let mut ctx = self.ctx.clone();
        ctx.retries = Arc::new(RetryScheduler::new());
        let retries = Arc::clone(&ctx.retries);

        let workers = (0..self.config.consumers)
            .map(|id| {
                let consumer = Consumer::new(id, ctx.clone());
                let cancel = cancel.clone();
                tokio::spawn(async move { consumer.run(cancel).await })
            })
            .collect();

        let ticker = {
            let ctx = ctx.clone();
            PeriodicTask::spawn_with_token(
                "billing-stats",
                self.config.stats_interval,
                cancel.child_token(),
                move || {
                    let stats = ctx.stats.snapshot();
                    tracing::info!(
                        queued = ctx.queue.len(),
                        discarded = ctx.queue.discard_count(),
                        dead_letters = ctx.dlq.size(),
                        pending_retries = ctx.retries.pending(),
                        processed = stats.processed,
                        succeeded = stats.succeeded,
                        retried = stats.retried,
                        dead_lettered = stats.dead_lettered,
                        "billing stats"
                    );
                    async {}
                },
            )
        };

        *running = Some(Running {
            cancel,
            workers,
            retries,
            ticker,
        });
        tracing::info!(consumers = self.config.consumers, "billing service started");
        Ok(())
    }

    /// Stop consumers, then push every pending retry back into the queue.
    /// Events still queued stay there. Stopping a stopped service is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        for worker in running.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "billing consumer panicked");
            }
        }
        running.retries.flush().await;
        running.ticker.stop().await;

        tracing::info!(
            queued = self.ctx.queue.len(),
            dead_letters = self.ctx.dlq.size(),
            "billing service stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Queue an event for debit
    pub async fn submit(&self, event: BillingEvent) -> Result<()> {
        self.ctx.queue.enqueue(event).await
    }

    /// Move every dead letter back into the queue with its retry count reset.
    ///
    /// Returns how many were re-queued; entries that do not fit go back to
    /// the dead-letter queue.
    pub async fn replay_dead_letters(&self) -> usize {
        let mut replayed = 0;
        for letter in self.ctx.dlq.drain() {
            let mut event = letter.event;
            event.retry_count = 0;
            match self.ctx.queue.enqueue(event.clone()).await {
                Ok(()) => replayed += 1,
                Err(e) => {
                    self.ctx
                        .dlq
                        .push(event, DeadLetterKind::QueueFull, format!("replay failed: {e}"));
                }
            }
        }
        tracing::info!(replayed, "dead letters replayed");
        replayed
    }

    pub fn queue(&self) -> &Arc<dyn EventQueue> {
        &self.ctx.queue
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.ctx.dlq
    }

    pub fn stats(&self) -> BillingStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Retry timers of the current run
    pub fn pending_retries(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map_or(0, |running| running.retries.pending())
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }
}

impl Drop for AsyncBillingService {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::event::ModelPricing;
    use crate::store::{InMemoryStore, UserRecord};

    fn service(quota: i64) -> (AsyncBillingService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.put_user(UserRecord::new(1, "alice", quota));
        let config = BillingConfig {
            consumers: 2,
            ..BillingConfig::default()
        };
        let pricing = PricingTable::new().with_model("gpt-4o", ModelPricing::new(1000.0, 1000.0));
        let service = AsyncBillingService::new(config, store.clone(), pricing).unwrap();
        (service, store)
    }

    async fn wait_for(service: &AsyncBillingService, done: impl Fn(BillingStatsSnapshot) -> bool) {
        while !done(service.stats()) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (service, _) = service(100);
        service.start().unwrap();
        assert!(service.start().is_err());
        service.stop().await;
        assert!(!service.is_running());
        service.start().unwrap();
        service.stop().await;
    }

    #[tokio::test]
    async fn test_events_are_debited() {
        let (service, store) = service(1_000);
        service.start().unwrap();
        for _ in 0..10 {
            service.submit(BillingEvent::new(1, "gpt-4o", 5, 5)).await.unwrap();
        }
        wait_for(&service, |s| s.succeeded == 10).await;
        service.stop().await;

        assert_eq!(store.quota(1), Some(900));
        assert_eq!(service.stats().debited, 100);
    }

    #[tokio::test]
    async fn test_replay_after_top_up() {
        let (service, store) = service(10);
        service.start().unwrap();
        service
            .submit(BillingEvent::new(1, "gpt-4o", 0, 0).with_cost(100))
            .await
            .unwrap();
        wait_for(&service, |s| s.dead_lettered == 1).await;
        assert_eq!(service.dead_letters().size(), 1);

        store.put_user(UserRecord::new(1, "alice", 500));
        assert_eq!(service.replay_dead_letters().await, 1);
        wait_for(&service, |s| s.succeeded == 1).await;
        service.stop().await;

        assert!(service.dead_letters().is_empty());
        assert_eq!(store.quota(1), Some(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_requeues_pending_retries() {
        let store = Arc::new(InMemoryStore::new());
        let config = BillingConfig {
            consumers: 1,
            consumer: ConsumerConfig {
                retry_delay: Duration::from_secs(3_600),
                ..ConsumerConfig::default()
            },
            ..BillingConfig::default()
        };
        // unknown user: every debit fails with a retryable outcome
        let service = AsyncBillingService::new(config, store, PricingTable::new()).unwrap();
        service.start().unwrap();
        service
            .submit(BillingEvent::new(42, "m", 0, 0).with_cost(1))
            .await
            .unwrap();
        wait_for(&service, |s| s.retried == 1).await;
        assert_eq!(service.pending_retries(), 1);
        assert!(service.queue().is_empty());

        service.stop().await;
        assert_eq!(service.queue().len(), 1);
        assert!(service.dead_letters().is_empty());
    }

    #[test]
    fn test_config_validation() {
        let store: Arc<dyn QuotaLedger> = Arc::new(InMemoryStore::new());
        let bad = BillingConfig {
            consumers: 0,
            ..BillingConfig::default()
        };
        assert!(AsyncBillingService::new(bad, store.clone(), PricingTable::new()).is_err());

        let negative = PricingTable::new().with_model("m", ModelPricing::new(-1.0, 1.0));
        assert!(AsyncBillingService::new(BillingConfig::default(), store, negative).is_err());
    }
}
