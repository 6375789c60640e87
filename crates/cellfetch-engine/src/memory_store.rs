//! In-process [`DurableStore`].
//!
//! Cloning a `MemoryStore` shares the underlying map, so two engines built on clones
//! behave like two contexts talking to one durable store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cellfetch_common::{Clock, DurableStore, StoreError};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct StoredValue {
    bytes: Vec<u8>,
    expires_at_ms: Option<i64>,
}

#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<FxHashMap<String, StoredValue>>>,
    clock: Arc<dyn Clock>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(FxHashMap::default())),
            clock,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an outage: every operation fails with `Unavailable` until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .values()
            .filter(|v| v.expires_at_ms.is_none_or(|at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently stored under `prefix`, expired ones included.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_online()?;
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.expires_at_ms.is_some_and(|at| at <= now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(v) => Ok(Some(v.bytes.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_online()?;
        let expires_at_ms = ttl.map(|ttl| self.clock.now_millis() + ttl.as_millis() as i64);
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellfetch_common::ManualClock;

    #[test]
    fn entries_expire_by_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());
        store
            .set("k", b"v".to_vec(), Some(Duration::from_secs(1)))
            .unwrap();
        store.set("forever", b"v".to_vec(), None).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.get("forever").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clones_share_state_and_outages() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        let other = store.clone();
        store.set("a", vec![1], None).unwrap();
        assert_eq!(other.get("a").unwrap(), Some(vec![1]));

        other.set_offline(true);
        assert!(matches!(store.get("a"), Err(StoreError::Unavailable(_))));
        other.set_offline(false);
        store.remove("a").unwrap();
        assert!(other.is_empty());
    }
}
