//! Two-tier value cache keyed by request fingerprint.
//!
//! The local tier is a process-lifetime map; the durable tier is whatever
//! [`DurableStore`] the host provides and is visible to other contexts. Reads go
//! local first, then durable, back-filling local on a durable hit.

use std::sync::Arc;
use std::time::Duration;

use cellfetch_common::{Clock, DurableStore, Fingerprint};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::metrics::EngineMetrics;

pub(crate) const CACHE_KEY_PREFIX: &str = "cellfetch:v1:cache:";

/// Durable key for a cached value.
pub fn durable_key(fingerprint: &Fingerprint) -> String {
    format!("{CACHE_KEY_PREFIX}{fingerprint}")
}

/// One cached value. Immutable once written; a later fetch overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: f64,
    pub written_at_ms: i64,
    pub ttl_ms: Option<u64>,
}

impl CacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now_ms >= self.written_at_ms.saturating_add(ttl as i64),
            None => false,
        }
    }
}

/// Result of a cache read. Zero is a value like any other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheLookup {
    Hit(f64),
    Miss,
}

impl CacheLookup {
    pub fn is_present(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            CacheLookup::Hit(v) => Some(*v),
            CacheLookup::Miss => None,
        }
    }
}

pub struct TieredCache {
    local: DashMap<Fingerprint, CacheEntry>,
    durable: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
    local_ttl: Option<Duration>,
    durable_ttl: Duration,
    capacity: usize,
    metrics: Arc<EngineMetrics>,
}

impl TieredCache {
    pub fn new(
        config: &CacheConfig,
        durable: Option<Arc<dyn DurableStore>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            local: DashMap::new(),
            durable,
            clock,
            local_ttl: config.local_ttl(),
            durable_ttl: config.durable_ttl(),
            capacity: config.local_capacity.max(1),
            metrics,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> CacheLookup {
        self.lookup(fingerprint, true)
    }

    /// Same as [`get`](Self::get) without touching hit/miss counters; used for the
    /// read-through re-checks that follow a suspension point.
    pub fn recheck(&self, fingerprint: &Fingerprint) -> CacheLookup {
        self.lookup(fingerprint, false)
    }

    fn lookup(&self, fingerprint: &Fingerprint, track: bool) -> CacheLookup {
        let now = self.clock.now_millis();

        let local = self.local.get(fingerprint).map(|e| *e);
        match local {
            Some(entry) if !entry.is_expired(now) => {
                if track {
                    self.metrics.record_local_hit();
                }
                return CacheLookup::Hit(entry.value);
            }
            Some(_) => self.drop_if_expired(fingerprint, now),
            None => {}
        }

        if let Some(entry) = self.read_durable(fingerprint, now) {
            if track {
                self.metrics.record_durable_hit();
            }
            let backfill = CacheEntry {
                ttl_ms: min_ttl(entry.ttl_ms, self.local_ttl.map(|t| t.as_millis() as u64)),
                ..entry
            };
            self.insert_local(fingerprint.clone(), backfill, now);
            return CacheLookup::Hit(entry.value);
        }

        if track {
            self.metrics.record_miss();
        }
        CacheLookup::Miss
    }

    /// Store with the configured TTLs.
    /// A concurrent `put` may have replaced the expired entry since it was read.
    fn drop_if_expired(&self, fingerprint: &Fingerprint, now: i64) {
        self.local.remove_if(fingerprint, |_, e| e.is_expired(now));
    }

    pub fn put(&self, fingerprint: &Fingerprint, value: f64) {
        self.write(fingerprint, value, self.local_ttl, Some(self.durable_ttl));
    }

    /// Store with one explicit TTL for both tiers.
    pub fn put_with_ttl(&self, fingerprint: &Fingerprint, value: f64, ttl: Duration) {
        self.write(fingerprint, value, Some(ttl), Some(ttl));
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        self.local.remove(fingerprint);
        if let Some(store) = &self.durable
            && let Err(_err) = store.remove(&durable_key(fingerprint))
        {
            self.metrics.record_store_error();
            #[cfg(feature = "tracing")]
            tracing::warn!(%fingerprint, error = %_err, "durable cache invalidation failed");
        }
    }

    pub fn clear_local(&self) {
        self.local.clear();
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Whether values written here are visible to other contexts.
    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    fn write(
        &self,
        fingerprint: &Fingerprint,
        value: f64,
        local_ttl: Option<Duration>,
        durable_ttl: Option<Duration>,
    ) {
        let now = self.clock.now_millis();
        let local_entry = CacheEntry {
            value,
            written_at_ms: now,
            ttl_ms: local_ttl.map(|t| t.as_millis() as u64),
        };
        self.insert_local(fingerprint.clone(), local_entry, now);

        let Some(store) = &self.durable else {
            return;
        };
        let durable_entry = CacheEntry {
            value,
            written_at_ms: now,
            ttl_ms: durable_ttl.map(|t| t.as_millis() as u64),
        };
        let result = serde_json::to_vec(&durable_entry)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                store
                    .set(&durable_key(fingerprint), bytes, durable_ttl)
                    .map_err(|e| e.to_string())
            });
        if let Err(_err) = result {
            // The local tier already holds the value; other contexts just miss.
            self.metrics.record_store_error();
            #[cfg(feature = "tracing")]
            tracing::warn!(%fingerprint, error = %_err, "durable cache write failed");
        }
    }

    fn read_durable(&self, fingerprint: &Fingerprint, now: i64) -> Option<CacheEntry> {
        let store = self.durable.as_ref()?;
        let key = durable_key(fingerprint);
        let bytes = match store.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(_err) => {
                self.metrics.record_store_error();
                #[cfg(feature = "tracing")]
                tracing::warn!(%fingerprint, error = %_err, "durable cache read failed, treating as miss");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(_err) => {
                self.metrics.record_store_error();
                #[cfg(feature = "tracing")]
                tracing::warn!(%fingerprint, error = %_err, "undecodable durable cache entry, treating as miss");
                return None;
            }
        };
        if entry.is_expired(now) || !entry.value.is_finite() {
            return None;
        }
        Some(entry)
    }

    fn insert_local(&self, fingerprint: Fingerprint, entry: CacheEntry, now: i64) {
        if self.local.len() >= self.capacity && !self.local.contains_key(&fingerprint) {
            self.local.retain(|_, e| !e.is_expired(now));
            if self.local.len() >= self.capacity {
                let victim = self.local.iter().next().map(|e| e.key().clone());
                if let Some(victim) = victim {
                    self.local.remove(&victim);
                }
            }
        }
        self.local.insert(fingerprint, entry);
    }
}

fn min_ttl(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
