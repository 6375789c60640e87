//! Meta crate that re-exports the cellfetch building blocks with sensible
//! defaults. Hosts that only need the shared request types can depend on the
//! `common` feature alone; the engine layer is opt-in behind `engine`.

#[cfg(feature = "common")]
pub use cellfetch_common as common;

#[cfg(feature = "engine")]
pub use cellfetch_engine as engine;

#[cfg(feature = "common")]
pub use cellfetch_common::{
    AccountingBackend, BalanceQuery, BookId, Clock, DimensionFilters, DurableStore, EntityId,
    FetchError, FetchErrorKind, ManualClock, Period,
};

#[cfg(all(feature = "common", feature = "system-clock"))]
pub use cellfetch_common::SystemClock;

#[cfg(feature = "engine")]
pub use cellfetch_engine::{
    Coalescer, EngineConfig, FlushReport, MemoryStore, MetricsSnapshot, PendingValue,
    PreloadWorker,
};
