//! Request coalescing.
//!
//! The first caller for a key becomes the leader: its future is boxed, made
//! [`Shared`] and parked in the flight map. Callers arriving while the flight
//! is pending await a clone of the same future and receive the same result.
//! Whichever caller observes completion first removes the entry, so the next
//! call for that key starts a fresh flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::Result;
use crate::metrics::Counter;

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Keyed set of in-flight computations
pub struct Group<V> {
    flights: Mutex<HashMap<String, (u64, Flight<V>)>>,
    next_id: AtomicU64,
    leaders: Counter,
    joined: Counter,
}

impl<V> Default for Group<V> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            leaders: Counter::new(),
            joined: Counter::new(),
        }
    }
}

impl<V> std::fmt::Debug for Group<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.flights.lock().len())
            .field("leaders", &self.leaders.get())
            .field("joined", &self.joined.get())
            .finish()
    }
}

impl<V> Group<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key` unless a flight is already pending, in which case
    /// wait for that flight instead.
    ///
    /// Returns the result and whether it was shared from another caller's
    /// flight. `f` is only invoked by the leader, and only to construct the
    /// future; it must not block.
    pub async fn work<F, Fut>(&self, key: &str, f: F) -> (Result<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (id, flight, shared) = {
            let mut flights = self.flights.lock();
            if let Some((id, flight)) = flights.get(key) {
                self.joined.inc();
                (*id, flight.clone(), true)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flight = f().boxed().shared();
                flights.insert(key.to_owned(), (id, flight.clone()));
                self.leaders.inc();
                (id, flight, false)
            }
        };

        if shared {
            tracing::trace!(key, "joined in-flight request");
        }

        let result = flight.await;
        self.forget(key, id);
        (result, shared)
    }

    /// Number of keys with a pending flight
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    /// Flights started
    pub fn leaders(&self) -> u64 {
        self.leaders.get()
    }

    /// Callers that piggybacked on another flight
    pub fn joined(&self) -> u64 {
        self.joined.get()
    }

    fn forget(&self, key: &str, id: u64) {
        let mut flights = self.flights.lock();
        if flights.get(key).is_some_and(|(current, _)| *current == id) {
            flights.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let group = Arc::new(Group::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                group
                    .work("user:1", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(42)
                    })
                    .await
            }));
        }

        // let every caller register before releasing the leader
        while group.joined() + group.leaders() < 8 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let mut shared = 0;
        for handle in handles {
            let (result, was_shared) = handle.await.unwrap();
            assert_eq!(result, Ok(42));
            shared += usize::from(was_shared);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 7);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_is_shared_and_flight_cleared() {
        let group = Group::<u32>::new();
        let (result, shared) = group
            .work("k", || async { Err(GatewayError::Transient("down".into())) })
            .await;
        assert_eq!(result, Err(GatewayError::Transient("down".into())));
        assert!(!shared);
        assert_eq!(group.in_flight(), 0);

        // a new flight starts after completion
        let (result, _) = group.work("k", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(group.leaders(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let group = Group::<&'static str>::new();
        let (a, _) = group.work("a", || async { Ok("a") }).await;
        let (b, _) = group.work("b", || async { Ok("b") }).await;
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Ok("b"));
        assert_eq!(group.joined(), 0);
    }
}
