//! Cancellable Periodic Tasks
//!
//! Background work (channel refresh, L1 eviction, billing stats) runs on a
//! ticker owned by the component that started it. Dropping the returned
//! [`PeriodicTask`] cancels the loop, so a background task can never outlive
//! its owner by accident.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a spawned ticker loop
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `interval` until stopped.
    ///
    /// The first run happens one full interval after spawning. Slow ticks
    /// delay the schedule rather than bursting to catch up.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_token(name, interval, CancellationToken::new(), tick)
    }

    /// Spawn bound to an existing token (cancelled together with a parent)
    pub fn spawn_with_token<F, Fut>(
        name: &'static str,
        interval: Duration,
        cancel: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately once; skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });

        tracing::debug!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Task name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the loop to stop and wait for the current tick to finish
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = PeriodicTask::spawn("test", Duration::from_secs(1), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Nothing runs before the first full interval
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.stop().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let token = CancellationToken::new();
        let task = PeriodicTask::spawn_with_token("drop", Duration::from_secs(1), token.clone(), || async {});
        assert!(!task.is_cancelled());
        drop(task);
        assert!(token.is_cancelled());
    }
}
