pub mod batch;
pub mod cache;
pub mod coalescer;
pub mod config;
pub mod grid;
pub mod individual;
pub mod ledger;
pub mod limiter;
pub mod memory_store;
pub mod metrics;
pub mod planner;
pub mod preload;
pub mod single_flight;

pub use cache::{CacheEntry, CacheLookup, TieredCache};
pub use coalescer::{Coalescer, FlushReport};
pub use config::{CacheConfig, ConfigError, EngineConfig, PreloadConfig, SafetyLimits};
pub use grid::{GridDescriptor, detect_grids};
pub use ledger::{PendingLedger, PendingValue};
pub use limiter::{LimitDecision, LimitExceeded, SafetyLimiter};
pub use memory_store::MemoryStore;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use planner::{BatchPlan, DispatchPlan, DispatchPlanner};
pub use preload::{
    PreloadCoordinator, PreloadState, PreloadStatus, PreloadTarget, PreloadWorker,
    TriggerOutcome, TriggerPayload, TriggerReason, WaitOutcome,
};

#[cfg(test)]
mod tests;
