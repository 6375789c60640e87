//! Common test helpers
use std::sync::Arc;

use cellfetch_common::{AccountingBackend, DurableStore, ManualClock};
use cellfetch_testkit::MockBackend;

use crate::coalescer::Coalescer;
use crate::config::EngineConfig;
use crate::memory_store::MemoryStore;

pub const START_MS: i64 = 1_750_000_000_000;

pub struct Harness {
    pub engine: Coalescer,
    pub backend: Arc<MockBackend>,
    pub clock: Arc<ManualClock>,
    pub store: MemoryStore,
}

/// Engine over a fresh mock backend and an in-memory durable store.
pub fn harness(config: EngineConfig) -> Harness {
    harness_with(config, MockBackend::new())
}

pub fn harness_with(config: EngineConfig, backend: MockBackend) -> Harness {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = MemoryStore::new(clock.clone());
    let backend = Arc::new(backend);
    let engine = engine_on(config, backend.clone(), store.clone(), clock.clone());
    Harness {
        engine,
        backend,
        clock,
        store,
    }
}

/// A second engine sharing `store`: another context of the same host.
pub fn engine_on(
    config: EngineConfig,
    backend: Arc<MockBackend>,
    store: MemoryStore,
    clock: Arc<ManualClock>,
) -> Coalescer {
    let backend: Arc<dyn AccountingBackend> = backend;
    let durable: Arc<dyn DurableStore> = Arc::new(store);
    Coalescer::with_clock(config, backend, Some(durable), clock)
}

pub fn preload_config(wait_ms: u64) -> EngineConfig {
    let mut config = EngineConfig::interactive();
    config.preload.wait_timeout_ms = wait_ms;
    config.preload.recheck_interval_ms = 100;
    config
}
