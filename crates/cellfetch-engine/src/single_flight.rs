//! Single-flight execution: at most one in-flight computation per key.
//!
//! The first caller for a key (the leader) spawns the work onto the runtime and
//! registers a [`Shared`] handle on it; every caller that arrives while it runs (a
//! follower) awaits that same handle. The registration is removed by a drop guard
//! owned by the spawned task, so it is released on success, error, panic and
//! runtime shutdown alike. A dropped caller never cancels the work.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cellfetch_common::FetchError;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub type FlightResult<V> = Result<V, FetchError>;
pub type SharedFlight<V> = Shared<BoxFuture<'static, FlightResult<V>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

struct Slot<V: Clone> {
    generation: u64,
    flight: SharedFlight<V>,
}

type Registry<K, V> = Arc<Mutex<FxHashMap<K, Slot<V>>>>;

pub struct SingleFlight<K, V: Clone> {
    inflight: Registry<K, V>,
    next_generation: Arc<AtomicU64>,
}

impl<K, V: Clone> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            next_generation: Arc::clone(&self.next_generation),
        }
    }
}

impl<K, V: Clone> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(FxHashMap::default())),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Removes the registration when the leader's task ends, however it ends.
struct LockRelease<K: Eq + Hash, V: Clone> {
    registry: Registry<K, V>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V: Clone> Drop for LockRelease<K, V> {
    fn drop(&mut self) {
        let mut map = self.registry.lock();
        if map
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            map.remove(&self.key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start it with `work` if none is running.
    /// `work` is only invoked for the leader. Must be called inside a tokio runtime.
    pub fn run<F, Fut>(&self, key: K, work: F) -> (FlightRole, SharedFlight<V>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult<V>> + Send + 'static,
    {
        let mut map = self.inflight.lock();
        if let Some(slot) = map.get(&key) {
            return (FlightRole::Follower, slot.flight.clone());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = LockRelease {
            registry: Arc::clone(&self.inflight),
            key: key.clone(),
            generation,
        };
        let fut = work();
        // The registry lock is held until the slot is inserted, so the guard cannot
        // run its removal before the insert even if the task finishes immediately.
        let handle = tokio::spawn(async move {
            let _release = guard;
            fut.await
        });
        let flight: SharedFlight<V> = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(FetchError::internal("fetch task panicked"))
                }
                Err(_) => Err(FetchError::cancelled("fetch task was cancelled")),
            }
        }
        .boxed()
        .shared();
        map.insert(
            key,
            Slot {
                generation,
                flight: flight.clone(),
            },
        );
        (FlightRole::Leader, flight)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}
