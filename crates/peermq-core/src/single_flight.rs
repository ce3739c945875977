//! Single-flight async initialization
//!
//! Coalesces concurrent requests for a not-yet-available resource into one
//! underlying operation. The first caller starts the operation; everyone who
//! arrives while it is in flight awaits the same shared future and receives
//! the same value (or the same error).
//!
//! ```text
//! caller A ──┐
//! caller B ──┼──▶ init() ──▶ Ready(v)  (cached, later callers return v)
//! caller C ──┘         └───▶ Err(e)    (every waiter gets e, slot cleared)
//! ```
//!
//! The shared future is driven by whichever waiter polls it, so a cancelled
//! caller does not strand the others.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{MqError, MqResult};

type SharedInit<V> = Shared<BoxFuture<'static, Result<V, Arc<MqError>>>>;

enum Slot<V: Clone> {
    Ready(V),
    InFlight(SharedInit<V>),
}

/// Keyed single-flight initializer.
pub struct SingleFlight<K, V: Clone> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty initializer map
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key` if initialization already completed.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// Snapshot of every initialized value.
    pub fn ready_values(&self) -> Vec<V> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(v) => Some(v.clone()),
                Slot::InFlight(_) => None,
            })
            .collect()
    }

    /// Get the value for `key`, running `init` at most once concurrently.
    ///
    /// `init` is only invoked when no value is cached and no initialization
    /// is in flight for this key.
    pub async fn get_or_try_init<F, Fut>(&self, key: K, init: F) -> MqResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MqResult<V>> + Send + 'static,
    {
        let flight = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(v)) => return Ok(v.clone()),
                Some(Slot::InFlight(flight)) => flight.clone(),
                None => {
                    let flight = init().map(|r| r.map_err(Arc::new)).boxed().shared();
                    slots.insert(key.clone(), Slot::InFlight(flight.clone()));
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slots = self.slots.lock();
        let still_ours = matches!(
            slots.get(&key),
            Some(Slot::InFlight(current)) if current.ptr_eq(&flight)
        );
        match &result {
            Ok(v) if still_ours => {
                slots.insert(key, Slot::Ready(v.clone()));
            }
            Err(_) if still_ours => {
                slots.remove(&key);
            }
            _ => {}
        }

        result.map_err(MqError::Shared)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Keyless single-flight: a one-time readiness barrier.
pub struct OnceFlight<V: Clone> {
    inner: SingleFlight<(), V>,
}

impl<V> OnceFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an uninitialized barrier
    pub fn new() -> Self {
        Self {
            inner: SingleFlight::new(),
        }
    }

    /// Value if already initialized
    pub fn get(&self) -> Option<V> {
        self.inner.get(&())
    }

    /// Initialize once, sharing the result with concurrent callers
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> MqResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MqResult<V>> + Send + 'static,
    {
        self.inner.get_or_try_init((), init).await
    }
}

impl<V> Default for OnceFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_init() {
        let flight: Arc<SingleFlight<u32, u64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .get_or_try_init(1, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.get(&1), Some(42));
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter_and_allows_retry() {
        let flight: Arc<SingleFlight<&'static str, u64>> = Arc::new(SingleFlight::new());

        let a = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .get_or_try_init("k", || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(MqError::Storage("boom".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = flight
            .get_or_try_init("k", || async { Ok(7) })
            .await;

        let a = a.await.unwrap();
        assert!(a.unwrap_err().is_storage());
        assert!(b.unwrap_err().is_storage());

        // Slot was cleared, so a new attempt runs
        let c = flight.get_or_try_init("k", || async { Ok(7) }).await;
        assert_eq!(c.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let flight: SingleFlight<u8, u8> = SingleFlight::new();
        assert_eq!(flight.get_or_try_init(1, || async { Ok(10) }).await.unwrap(), 10);
        assert_eq!(flight.get_or_try_init(2, || async { Ok(20) }).await.unwrap(), 20);
        let mut values = flight.ready_values();
        values.sort();
        assert_eq!(values, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_once_flight_caches() {
        let once: OnceFlight<String> = OnceFlight::new();
        assert!(once.get().is_none());
        let v = once.get_or_try_init(|| async { Ok("ready".to_string()) }).await.unwrap();
        assert_eq!(v, "ready");
        let again = once
            .get_or_try_init(|| async { Err(MqError::Storage("not called".into())) })
            .await
            .unwrap();
        assert_eq!(again, "ready");
    }
}
