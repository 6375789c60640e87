//! Batch fetch orchestration for accepted grids.
//!
//! One grid costs two backend calls: opening values as of the anchor and per-period
//! deltas over `earliest_from..=latest_to`. The two are combined locally into
//! running balances, from which every member and rider is answered:
//!
//! ```text
//! balance(anchor) = opening
//! balance(p)      = balance(p - 1) + delta(p)
//! activity(f..=t) = balance(t) - balance(pred(f))
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use cellfetch_common::{
    AccountingBackend, BalanceQuery, EntityId, EntityPeriodValues, EntityValues, FetchError,
    Fingerprint, OpeningValuesRequest, Period, PeriodDeltasRequest,
};

use crate::cache::TieredCache;
use crate::grid::GridDescriptor;
use crate::ledger::{PendingLedger, PendingRequest};
use crate::metrics::EngineMetrics;
use crate::planner::BatchPlan;
use crate::single_flight::{FlightRole, SingleFlight};

/// Running balances for every grid entity from the anchor through `latest_to`.
#[derive(Debug, Clone, PartialEq)]
pub struct GridValues {
    anchor: Period,
    latest_to: Period,
    balances: BTreeMap<EntityId, Vec<f64>>,
}

impl GridValues {
    /// Validate both responses against the grid and fold them into balances. Anything
    /// missing or non-finite is a shape error; nothing is ever coerced to zero.
    pub fn combine(
        grid: &GridDescriptor,
        opening: &EntityValues,
        deltas: &EntityPeriodValues,
    ) -> Result<Self, FetchError> {
        let anchor = grid.anchor();
        let mut balances = BTreeMap::new();
        for entity in &grid.entities {
            let open = *opening.get(entity).ok_or_else(|| {
                FetchError::shape(format!("opening values missing entity {entity}"))
            })?;
            if !open.is_finite() {
                return Err(FetchError::shape(format!(
                    "opening value for {entity} is not a finite number"
                )));
            }
            let per_period = deltas.get(entity).ok_or_else(|| {
                FetchError::shape(format!("period deltas missing entity {entity}"))
            })?;

            let mut running = Vec::with_capacity(grid.delta_span() + 1);
            running.push(open);
            let mut balance = open;
            for period in Period::range_inclusive(grid.earliest_from, grid.latest_to) {
                let delta = *per_period.get(&period).ok_or_else(|| {
                    FetchError::shape(format!("period deltas missing {entity} / {period}"))
                })?;
                if !delta.is_finite() {
                    return Err(FetchError::shape(format!(
                        "delta for {entity} / {period} is not a finite number"
                    )));
                }
                balance += delta;
                running.push(balance);
            }
            balances.insert(entity.clone(), running);
        }
        Ok(Self {
            anchor,
            latest_to: grid.latest_to,
            balances,
        })
    }

    /// Balance of `entity` as of the close of `period`, if the grid covers it.
    pub fn balance(&self, entity: &EntityId, period: Period) -> Option<f64> {
        if period < self.anchor || period > self.latest_to {
            return None;
        }
        let idx = self.anchor.months_until(period) as usize;
        self.balances.get(entity)?.get(idx).copied()
    }

    pub fn value_for(&self, query: &BalanceQuery) -> Option<f64> {
        let to = self.balance(query.entity(), query.to_period())?;
        match query.from_period() {
            None => Some(to),
            Some(from) => Some(to - self.balance(query.entity(), from.pred())?),
        }
    }
}

/// What one `execute` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub role: FlightRole,
    pub resolved: usize,
    pub error: Option<FetchError>,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    backend: Arc<dyn AccountingBackend>,
    cache: Arc<TieredCache>,
    ledger: Arc<PendingLedger>,
    metrics: Arc<EngineMetrics>,
    flights: SingleFlight<Fingerprint, Arc<GridValues>>,
}

impl BatchOrchestrator {
    pub fn new(
        backend: Arc<dyn AccountingBackend>,
        cache: Arc<TieredCache>,
        ledger: Arc<PendingLedger>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            backend,
            cache,
            ledger,
            metrics,
            flights: SingleFlight::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.in_flight_count()
    }

    /// Run (or join) the bulk fetch for `plan` and resolve every request in it.
    pub async fn execute(&self, plan: BatchPlan) -> BatchOutcome {
        let requests: Vec<PendingRequest> = plan.requests().cloned().collect();
        let leader_requests = requests.clone();
        let this = self.clone();
        let descriptor = plan.descriptor.clone();

        let (role, flight) = self.flights.run(plan.batch_fingerprint.clone(), move || {
            async move {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    batch = %descriptor.batch_fingerprint(),
                    entities = descriptor.entity_count(),
                    anchor = %descriptor.anchor(),
                    to = %descriptor.latest_to,
                    "batch fetch started"
                );
                let values = Arc::new(this.fetch_grid(&descriptor).await?);
                this.settle(&leader_requests, &values);
                Ok(values)
            }
        });
        self.metrics
            .record_batch(role == FlightRole::Leader, requests.len());

        match flight.await {
            Ok(values) => {
                let resolved = match role {
                    // The leader's task already wrote and resolved its requests.
                    FlightRole::Leader => requests.len(),
                    FlightRole::Follower => self.settle(&requests, &values),
                };
                BatchOutcome {
                    role,
                    resolved,
                    error: None,
                }
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    batch = %plan.batch_fingerprint,
                    error = %err,
                    requests = requests.len(),
                    "batch fetch failed"
                );
                for req in &requests {
                    self.ledger.resolve(&req.fingerprint, Err(err.clone()));
                }
                BatchOutcome {
                    role,
                    resolved: requests.len(),
                    error: Some(err),
                }
            }
        }
    }

    async fn fetch_grid(&self, grid: &GridDescriptor) -> Result<GridValues, FetchError> {
        let entities: Vec<EntityId> = grid.entities.iter().cloned().collect();
        let opening_req = OpeningValuesRequest {
            entities: entities.clone(),
            anchor: grid.anchor(),
            filters: grid.filters.clone(),
            book: grid.book,
        };
        let deltas_req = PeriodDeltasRequest {
            entities,
            from: grid.earliest_from,
            to: grid.latest_to,
            filters: grid.filters.clone(),
            book: grid.book,
        };

        let (opening, deltas) = futures::future::join(
            self.backend.opening_values(&opening_req),
            self.backend.period_deltas(&deltas_req),
        )
        .await;
        self.metrics.record_backend_call(opening.is_ok());
        self.metrics.record_backend_call(deltas.is_ok());

        GridValues::combine(grid, &opening?, &deltas?)
    }

    /// Write each covered value to the cache, then release its callers.
    fn settle(&self, requests: &[PendingRequest], values: &GridValues) -> usize {
        let mut resolved = 0;
        for req in requests {
            let result = match values.value_for(&req.query) {
                Some(v) => {
                    self.cache.put(&req.fingerprint, v);
                    Ok(v)
                }
                None => Err(FetchError::shape(format!(
                    "grid result does not cover {}",
                    req.query
                ))),
            };
            self.ledger.resolve(&req.fingerprint, result);
            resolved += 1;
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::detect_grids;
    use cellfetch_common::{FetchErrorKind, QueryFingerprint};

    fn p(y: i32, m: u32) -> Period {
        Period::new(y, m).unwrap()
    }

    fn grid() -> GridDescriptor {
        let reqs: Vec<PendingRequest> = [("A", 1), ("B", 2)]
            .into_iter()
            .map(|(e, m)| {
                let query = BalanceQuery::activity(e, p(2025, 1), p(2025, m + 1)).unwrap();
                PendingRequest {
                    fingerprint: query.fingerprint(),
                    query,
                }
            })
            .collect();
        detect_grids(&reqs).grids.remove(0).descriptor
    }

    fn responses() -> (EntityValues, EntityPeriodValues) {
        let a = EntityId::new("A");
        let b = EntityId::new("B");
        let opening = EntityValues::from([(a.clone(), 100.0), (b.clone(), 0.0)]);
        let deltas = EntityPeriodValues::from([
            (
                a,
                BTreeMap::from([(p(2025, 1), 10.0), (p(2025, 2), 20.0), (p(2025, 3), 30.0)]),
            ),
            (
                b,
                BTreeMap::from([(p(2025, 1), -5.0), (p(2025, 2), 0.0), (p(2025, 3), 5.0)]),
            ),
        ]);
        (opening, deltas)
    }

    #[test]
    fn running_balances_answer_every_shape() {
        let (opening, deltas) = responses();
        let values = GridValues::combine(&grid(), &opening, &deltas).unwrap();
        let a = EntityId::new("A");
        assert_eq!(values.balance(&a, p(2024, 12)), Some(100.0));
        assert_eq!(values.balance(&a, p(2025, 3)), Some(160.0));
        assert_eq!(values.balance(&a, p(2025, 4)), None);

        let q = BalanceQuery::activity("A", p(2025, 2), p(2025, 3)).unwrap();
        assert_eq!(values.value_for(&q), Some(50.0));
        let q = BalanceQuery::cumulative("B", p(2025, 2)).unwrap();
        assert_eq!(values.value_for(&q), Some(-5.0));
        let q = BalanceQuery::activity("B", p(2025, 2), p(2025, 2)).unwrap();
        assert_eq!(values.value_for(&q), Some(0.0));
        let q = BalanceQuery::cumulative("C", p(2025, 2)).unwrap();
        assert_eq!(values.value_for(&q), None);
    }

    #[test]
    fn missing_period_is_a_shape_error() {
        let (opening, mut deltas) = responses();
        deltas
            .get_mut(&EntityId::new("B"))
            .unwrap()
            .remove(&p(2025, 2));
        let err = GridValues::combine(&grid(), &opening, &deltas).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Shape);
        assert!(err.message.unwrap().contains("Feb 2025"));
    }

    #[test]
    fn missing_entity_or_nan_is_a_shape_error() {
        let (mut opening, deltas) = responses();
        opening.remove(&EntityId::new("A"));
        let err = GridValues::combine(&grid(), &opening, &deltas).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Shape);

        let (mut opening, deltas) = responses();
        opening.insert(EntityId::new("A"), f64::NAN);
        let err = GridValues::combine(&grid(), &opening, &deltas).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Shape);
    }
}
