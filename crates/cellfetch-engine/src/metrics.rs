//! Lightweight counters for coalescing and cache behaviour

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters collected while requests flow through the engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    // Intake
    pub requests_submitted: AtomicU64,
    pub requests_joined: AtomicU64,

    // Cache performance
    pub cache_hits_local: AtomicU64,
    pub cache_hits_durable: AtomicU64,
    pub cache_misses: AtomicU64,
    pub store_errors: AtomicU64,

    // Planning
    pub grids_detected: AtomicU64,
    pub grids_rejected: AtomicU64,

    // Execution
    pub batch_leaders: AtomicU64,
    pub batch_followers: AtomicU64,
    pub batched_requests: AtomicU64,
    pub individual_requests: AtomicU64,
    pub individual_followers: AtomicU64,
    pub backend_calls: AtomicU64,
    pub backend_errors: AtomicU64,

    // Preload
    pub preload_triggers: AtomicU64,
    pub preload_merges: AtomicU64,
    pub preload_waits: AtomicU64,
    pub preload_wait_timeouts: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_submitted: u64,
    pub requests_joined: u64,
    pub cache_hits_local: u64,
    pub cache_hits_durable: u64,
    pub cache_misses: u64,
    pub store_errors: u64,
    pub grids_detected: u64,
    pub grids_rejected: u64,
    pub batch_leaders: u64,
    pub batch_followers: u64,
    pub batched_requests: u64,
    pub individual_requests: u64,
    pub individual_followers: u64,
    pub backend_calls: u64,
    pub backend_errors: u64,
    pub preload_triggers: u64,
    pub preload_merges: u64,
    pub preload_waits: u64,
    pub preload_wait_timeouts: u64,
}

impl MetricsSnapshot {
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits_local + self.cache_hits_durable
    }
}

#[inline]
fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submit(&self) {
        bump(&self.requests_submitted, 1);
    }

    pub fn record_join(&self) {
        bump(&self.requests_joined, 1);
    }

    pub fn record_local_hit(&self) {
        bump(&self.cache_hits_local, 1);
    }

    pub fn record_durable_hit(&self) {
        bump(&self.cache_hits_durable, 1);
    }

    pub fn record_miss(&self) {
        bump(&self.cache_misses, 1);
    }

    pub fn record_store_error(&self) {
        bump(&self.store_errors, 1);
    }

    pub fn record_grid(&self, accepted: bool) {
        if accepted {
            bump(&self.grids_detected, 1);
        } else {
            bump(&self.grids_rejected, 1);
        }
    }

    pub fn record_batch(&self, leader: bool, requests: usize) {
        if leader {
            bump(&self.batch_leaders, 1);
        } else {
            bump(&self.batch_followers, 1);
        }
        bump(&self.batched_requests, requests as u64);
    }

    pub fn record_individual(&self, leader: bool) {
        bump(&self.individual_requests, 1);
        if !leader {
            bump(&self.individual_followers, 1);
        }
    }

    pub fn record_backend_call(&self, ok: bool) {
        bump(&self.backend_calls, 1);
        if !ok {
            bump(&self.backend_errors, 1);
        }
    }

    pub fn record_preload_trigger(&self, merged: bool) {
        if merged {
            bump(&self.preload_merges, 1);
        } else {
            bump(&self.preload_triggers, 1);
        }
    }

    pub fn record_preload_wait(&self, timed_out: bool) {
        bump(&self.preload_waits, 1);
        if timed_out {
            bump(&self.preload_wait_timeouts, 1);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_submitted: get(&self.requests_submitted),
            requests_joined: get(&self.requests_joined),
            cache_hits_local: get(&self.cache_hits_local),
            cache_hits_durable: get(&self.cache_hits_durable),
            cache_misses: get(&self.cache_misses),
            store_errors: get(&self.store_errors),
            grids_detected: get(&self.grids_detected),
            grids_rejected: get(&self.grids_rejected),
            batch_leaders: get(&self.batch_leaders),
            batch_followers: get(&self.batch_followers),
            batched_requests: get(&self.batched_requests),
            individual_requests: get(&self.individual_requests),
            individual_followers: get(&self.individual_followers),
            backend_calls: get(&self.backend_calls),
            backend_errors: get(&self.backend_errors),
            preload_triggers: get(&self.preload_triggers),
            preload_merges: get(&self.preload_merges),
            preload_waits: get(&self.preload_waits),
            preload_wait_timeouts: get(&self.preload_wait_timeouts),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.requests_submitted,
            &self.requests_joined,
            &self.cache_hits_local,
            &self.cache_hits_durable,
            &self.cache_misses,
            &self.store_errors,
            &self.grids_detected,
            &self.grids_rejected,
            &self.batch_leaders,
            &self.batch_followers,
            &self.batched_requests,
            &self.individual_requests,
            &self.individual_followers,
            &self.backend_calls,
            &self.backend_errors,
            &self.preload_triggers,
            &self.preload_merges,
            &self.preload_waits,
            &self.preload_wait_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
