// =============================================================================
// Single-flight — one in-flight initialisation per key
// =============================================================================
//
// The first caller for a key becomes the leader and installs a shared future;
// concurrent callers for the same key await that same future and receive a
// clone of its output. The slot is cleared as soon as the flight completes so
// later calls start fresh.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type Flight<T> = Shared<BoxFuture<'static, T>>;

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Mutex<HashMap<String, (u64, Flight<T>)>>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `init` for `key` unless a flight for `key` is already running, in
    /// which case wait for it. `init` is only called by the leader.
    pub async fn run<F, Fut>(&self, key: &str, init: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, flight) = {
            let mut map = self.inflight.lock();
            match map.get(key) {
                Some((id, flight)) => (*id, flight.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = init().boxed().shared();
                    map.insert(key.to_string(), (id, flight.clone()));
                    (id, flight)
                }
            }
        };

        let out = flight.await;

        // Whoever finishes first clears the slot, but only if it still holds
        // this flight and not a newer one.
        let mut map = self.inflight.lock();
        if map.get(key).is_some_and(|(current, _)| *current == id) {
            map.remove(key);
        }
        out
    }

    /// Number of keys with a flight currently registered.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_run() {
        let group = Arc::new(SingleFlight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("BTC", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let group = SingleFlight::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 1..=3 {
            let c = calls.clone();
            let out = group
                .run("ETH", move || async move { c.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(out, expected);
        }
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let group = SingleFlight::<String>::new();
        let a = group.run("A", || async { "a".to_string() }).await;
        let b = group.run("B", || async { "b".to_string() }).await;
        assert_eq!(a, "a");
        assert_eq!(b, "b");
    }
}
