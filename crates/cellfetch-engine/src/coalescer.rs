//! The engine facade the host talks to.
//!
//! `submit` files a request; `flush` runs one coalescing tick; `request` does both,
//! letting requests accumulate for the configured window first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cellfetch_common::{
    AccountingBackend, BalanceQuery, Clock, DurableStore, FetchError, Fingerprint,
    QueryFingerprint,
};

use crate::batch::BatchOrchestrator;
use crate::cache::{CacheLookup, TieredCache};
use crate::config::EngineConfig;
use crate::individual::IndividualFetcher;
use crate::ledger::{Admission, PendingLedger, PendingRequest, PendingValue};
use crate::memory_store::MemoryStore;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::planner::{DispatchPlan, DispatchPlanner};
use crate::preload::{PreloadCoordinator, PreloadWorker};

/// What one coalescing tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Waiting requests taken from the ledger.
    pub claimed: usize,
    /// Claimed requests answered by the cache re-check.
    pub cache_hits: usize,
    pub batches: usize,
    pub batched: usize,
    pub individual: usize,
    pub rejected_grids: usize,
}

struct Inner {
    config: EngineConfig,
    backend: Arc<dyn AccountingBackend>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    cache: Arc<TieredCache>,
    ledger: Arc<PendingLedger>,
    planner: DispatchPlanner,
    batches: BatchOrchestrator,
    individual: IndividualFetcher,
    preload: Option<Arc<PreloadCoordinator>>,
    tick_scheduled: AtomicBool,
}

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

impl Coalescer {
    /// Engine on the system clock.
    #[cfg(feature = "system-clock")]
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn AccountingBackend>,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        Self::with_clock(config, backend, durable, Arc::new(cellfetch_common::SystemClock))
    }

    /// Without a durable store the cache is process-local and preload coordination
    /// (when enabled) runs against an in-process store.
    pub fn with_clock(
        config: EngineConfig,
        backend: Arc<dyn AccountingBackend>,
        durable: Option<Arc<dyn DurableStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let cache = Arc::new(TieredCache::new(
            &config.cache,
            durable.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let ledger = Arc::new(PendingLedger::new());
        let preload = config.preload.enabled.then(|| {
            let store: Arc<dyn DurableStore> = match &durable {
                Some(store) => store.clone(),
                None => Arc::new(MemoryStore::new(clock.clone())),
            };
            Arc::new(PreloadCoordinator::new(
                store,
                clock.clone(),
                config.preload.clone(),
                metrics.clone(),
            ))
        });

        let batches = BatchOrchestrator::new(
            backend.clone(),
            cache.clone(),
            ledger.clone(),
            metrics.clone(),
        );
        let individual = IndividualFetcher::new(
            backend.clone(),
            cache.clone(),
            ledger.clone(),
            metrics.clone(),
            preload.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                planner: DispatchPlanner::new(config.limits.clone(), config.batching_enabled),
                config,
                backend,
                clock,
                metrics,
                cache,
                ledger,
                batches,
                individual,
                preload,
                tick_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// File a request. A cache hit resolves immediately; otherwise the request waits
    /// in the ledger for the next tick, or joins an identical pending one.
    pub fn submit(&self, query: BalanceQuery) -> PendingValue {
        let inner = &self.inner;
        inner.metrics.record_submit();
        let fingerprint = query.fingerprint();

        if let CacheLookup::Hit(v) = inner.cache.get(&fingerprint) {
            return PendingValue::ready(Ok(v));
        }
        if let Some(preload) = &inner.preload {
            preload.observe(&query);
        }

        let (value, admission) = inner.ledger.submit_with_fingerprint(fingerprint, query);
        if let Admission::Joined(_) = admission {
            inner.metrics.record_join();
        }
        value
    }

    /// Submit from raw host arguments; parse failures resolve immediately.
    pub fn submit_host(&self, entity: &str, from: &str, to: &str) -> PendingValue {
        match BalanceQuery::from_host(entity, from, to) {
            Ok(query) => self.submit(query),
            Err(err) => PendingValue::ready(Err(err)),
        }
    }

    /// Submit, make sure a tick is coming, and wait for the value.
    pub async fn request(&self, query: BalanceQuery) -> Result<f64, FetchError> {
        let value = self.submit(query);
        self.schedule_tick();
        value.await
    }

    fn schedule_tick(&self) {
        if !self.inner.ledger.has_waiting() {
            return;
        }
        if self.inner.tick_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = self.clone();
        let window = self.inner.config.coalesce_window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Cleared before claiming: anything filed after this point schedules anew.
            engine.inner.tick_scheduled.store(false, Ordering::Release);
            engine.flush().await;
        });
    }

    /// Run one coalescing tick over every waiting request. Jobs run in spawned tasks,
    /// so dropping this future does not strand any caller.
    pub async fn flush(&self) -> FlushReport {
        let (report, plan) = self.prepare();
        let mut jobs = Vec::with_capacity(plan.batches.len() + plan.individual.len());

        for batch in plan.batches {
            let fingerprints: Vec<Fingerprint> =
                batch.requests().map(|r| r.fingerprint.clone()).collect();
            let orchestrator = self.inner.batches.clone();
            jobs.push((
                fingerprints,
                tokio::spawn(async move {
                    orchestrator.execute(batch).await;
                }),
            ));
        }
        for request in plan.individual {
            let fingerprints = vec![request.fingerprint.clone()];
            let fetcher = self.inner.individual.clone();
            jobs.push((
                fingerprints,
                tokio::spawn(async move {
                    fetcher.execute(request).await;
                }),
            ));
        }

        let (fingerprints, handles): (Vec<_>, Vec<_>) = jobs.into_iter().unzip();
        let results = futures::future::join_all(handles).await;
        for (fps, result) in fingerprints.iter().zip(results) {
            if result.is_err() {
                // A job that died never resolved its callers.
                for fp in fps {
                    self.inner
                        .ledger
                        .resolve(fp, Err(FetchError::internal("fetch job failed")));
                }
            }
        }
        report
    }

    /// Claim, re-check and plan. Synchronous so no lock or span crosses an await.
    fn prepare(&self) -> (FlushReport, DispatchPlan) {
        let inner = &self.inner;
        let claimed = inner.ledger.claim_waiting();

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("flush", claimed = claimed.len()).entered();

        let mut report = FlushReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        let mut misses: Vec<PendingRequest> = Vec::with_capacity(claimed.len());
        for request in claimed {
            match inner.cache.recheck(&request.fingerprint) {
                CacheLookup::Hit(v) => {
                    inner.ledger.resolve(&request.fingerprint, Ok(v));
                    report.cache_hits += 1;
                }
                CacheLookup::Miss => misses.push(request),
            }
        }

        let plan = inner.planner.plan(misses);
        for _ in &plan.rejected {
            inner.metrics.record_grid(false);
        }
        for _ in &plan.batches {
            inner.metrics.record_grid(true);
        }
        report.batches = plan.batches.len();
        report.batched = plan.batched_count();
        report.individual = plan.individual.len();
        report.rejected_grids = plan.rejected.len();

        #[cfg(feature = "tracing")]
        tracing::debug!(?report, "flush planned");
        (report, plan)
    }

    /// Fail every outstanding caller with a cancellation error.
    pub fn shutdown(&self) -> usize {
        self.inner.ledger.cancel_all("engine shut down")
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    pub fn preload(&self) -> Option<&Arc<PreloadCoordinator>> {
        self.inner.preload.as_ref()
    }

    /// A warm-up worker sharing this engine's backend, cache and coordinator.
    pub fn preload_worker(&self) -> Option<PreloadWorker> {
        let coordinator = self.inner.preload.clone()?;
        Some(PreloadWorker::new(
            self.inner.backend.clone(),
            self.inner.cache.clone(),
            coordinator,
            self.inner.metrics.clone(),
        ))
    }

    pub fn pending_len(&self) -> usize {
        self.inner.ledger.len()
    }

    pub fn batches_in_flight(&self) -> usize {
        self.inner.batches.in_flight()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }
}
