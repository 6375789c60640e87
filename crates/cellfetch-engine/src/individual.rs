//! One-request-at-a-time fallback.

use std::sync::Arc;

use cellfetch_common::{AccountingBackend, FetchError, Fingerprint};

use crate::cache::{CacheLookup, TieredCache};
use crate::ledger::{PendingLedger, PendingRequest};
use crate::metrics::EngineMetrics;
use crate::preload::{PreloadCoordinator, WaitOutcome};
use crate::single_flight::{FlightRole, SingleFlight};

/// How an individual request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndividualSource {
    Cache,
    /// Found in the cache after waiting for a preload.
    Preload,
    Fetched(FlightRole),
    Failed,
}

#[derive(Clone)]
pub struct IndividualFetcher {
    backend: Arc<dyn AccountingBackend>,
    cache: Arc<TieredCache>,
    ledger: Arc<PendingLedger>,
    metrics: Arc<EngineMetrics>,
    preload: Option<Arc<PreloadCoordinator>>,
    flights: SingleFlight<Fingerprint, f64>,
}

impl IndividualFetcher {
    pub fn new(
        backend: Arc<dyn AccountingBackend>,
        cache: Arc<TieredCache>,
        ledger: Arc<PendingLedger>,
        metrics: Arc<EngineMetrics>,
        preload: Option<Arc<PreloadCoordinator>>,
    ) -> Self {
        Self {
            backend,
            cache,
            ledger,
            metrics,
            preload,
            flights: SingleFlight::new(),
        }
    }

    pub async fn execute(&self, request: PendingRequest) -> IndividualSource {
        let fingerprint = request.fingerprint.clone();
        if let CacheLookup::Hit(v) = self.cache.recheck(&fingerprint) {
            self.ledger.resolve(&fingerprint, Ok(v));
            return IndividualSource::Cache;
        }

        if let Some(v) = self.await_preload(&request).await {
            self.ledger.resolve(&fingerprint, Ok(v));
            return IndividualSource::Preload;
        }

        let this = self.clone();
        let leader_request = request.clone();
        let (role, flight) = self.flights.run(fingerprint.clone(), move || async move {
            let result = this.backend.single_value(&leader_request.query).await;
            this.metrics.record_backend_call(result.is_ok());
            let value = result?;
            if !value.is_finite() {
                return Err(FetchError::shape(format!(
                    "backend returned a non-finite value for {}",
                    leader_request.query
                )));
            }
            this.cache.put(&leader_request.fingerprint, value);
            this.ledger.resolve(&leader_request.fingerprint, Ok(value));
            Ok(value)
        });
        self.metrics.record_individual(role == FlightRole::Leader);

        match flight.await {
            Ok(value) => {
                // A follower's callers may have joined after the leader resolved.
                self.ledger.resolve(&fingerprint, Ok(value));
                IndividualSource::Fetched(role)
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(request = %request.query, error = %err, "individual fetch failed");
                self.ledger.resolve(&fingerprint, Err(err));
                IndividualSource::Failed
            }
        }
    }

    /// Bounded preload wait: wait, re-check, scoped retrigger, wait, re-check.
    async fn await_preload(&self, request: &PendingRequest) -> Option<f64> {
        let preload = self.preload.as_ref()?;
        let period = request.query.to_period();
        if !preload.is_pending(period) {
            return None;
        }
        let timeout = preload.config().wait_timeout();

        let _first = preload.wait_for(period, timeout).await;
        if let CacheLookup::Hit(v) = self.cache.recheck(&request.fingerprint) {
            return Some(v);
        }
        if !preload.config().scoped_retrigger {
            return None;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(request = %request.query, wait = ?_first, "preload did not cover request, retriggering scoped");
        if let Err(_err) = preload.scoped_retrigger(&request.query) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "scoped preload trigger failed");
            return None;
        }
        if preload.wait_for(period, timeout).await == WaitOutcome::NotPending {
            return None;
        }
        self.cache.recheck(&request.fingerprint).value()
    }
}
