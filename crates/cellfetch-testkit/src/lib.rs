//! Test support: a scripted accounting backend that records every call, and a few
//! request fixtures.
//!
//! [`MockBackend`] answers from one deterministic ledger model, so bulk and
//! single-value answers always agree:
//!
//! ```text
//! delta(e, p)          integer-valued, derived from entity, period, filters, book
//! balance(e, p)        sum of delta(e, q) for EPOCH <= q <= p (0 before EPOCH)
//! opening_values       balance(e, anchor)
//! period_deltas        delta(e, p) for p in from..=to
//! single_value         balance(to) or balance(to) - balance(pred(from))
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use cellfetch_common::{
    AccountingBackend, BalanceQuery, BookId, DimensionFilters, EntityId, EntityPeriodValues,
    EntityValues, FetchError, FetchErrorKind, OpeningValuesRequest, Period, PeriodDeltasRequest,
};
use parking_lot::Mutex;

pub mod fixtures;

/// First period with activity in the model.
pub fn epoch() -> Period {
    Period::new(2020, 1).expect("valid epoch")
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    OpeningValues(OpeningValuesRequest),
    PeriodDeltas(PeriodDeltasRequest),
    SingleValue(BalanceQuery),
}

#[derive(Default)]
struct Script {
    calls: Vec<BackendCall>,
    fail_next: VecDeque<FetchErrorKind>,
    fail_all: Option<FetchErrorKind>,
    omitted: BTreeSet<EntityId>,
    overrides: BTreeMap<(EntityId, Period), f64>,
}

#[derive(Default)]
pub struct MockBackend {
    script: Mutex<Script>,
    latency: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long (tokio time) after being recorded.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the model's delta for one entity and period (all filters and books).
    pub fn with_delta(self, entity: &str, period: Period, delta: f64) -> Self {
        self.script
            .lock()
            .overrides
            .insert((EntityId::new(entity), period), delta);
        self
    }

    /// Fail the next call with `kind`. Queued failures are consumed in order.
    pub fn fail_next(&self, kind: FetchErrorKind) {
        self.script.lock().fail_next.push_back(kind);
    }

    /// Fail every call with `kind` until cleared with `None`.
    pub fn fail_all(&self, kind: Option<FetchErrorKind>) {
        self.script.lock().fail_all = kind;
    }

    /// Leave `entity` out of bulk responses (a malformed payload).
    pub fn omit_entity(&self, entity: &str) {
        self.script.lock().omitted.insert(EntityId::new(entity));
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.script.lock().calls.clone()
    }

    pub fn opening_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::OpeningValues(_)))
    }

    pub fn delta_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::PeriodDeltas(_)))
    }

    pub fn single_calls(&self) -> usize {
        self.count(|c| matches!(c, BackendCall::SingleValue(_)))
    }

    pub fn bulk_calls(&self) -> usize {
        self.opening_calls() + self.delta_calls()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().calls.len()
    }

    pub fn reset_calls(&self) {
        self.script.lock().calls.clear();
    }

    fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.script.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// The model's activity for one entity and period.
    pub fn delta(
        &self,
        entity: &EntityId,
        period: Period,
        filters: &DimensionFilters,
        book: BookId,
    ) -> f64 {
        if let Some(v) = self.script.lock().overrides.get(&(entity.clone(), period)) {
            return *v;
        }
        model_delta(entity, period, filters, book)
    }

    /// The model's balance as of the close of `period`.
    pub fn balance(
        &self,
        entity: &EntityId,
        period: Period,
        filters: &DimensionFilters,
        book: BookId,
    ) -> f64 {
        if period < epoch() {
            return 0.0;
        }
        Period::range_inclusive(epoch(), period)
            .map(|p| self.delta(entity, p, filters, book))
            .sum()
    }

    /// What `single_value` would answer for `query`, without recording a call.
    pub fn expected(&self, query: &BalanceQuery) -> f64 {
        let (entity, filters, book) = (query.entity(), query.filters(), query.book());
        let to = self.balance(entity, query.to_period(), filters, book);
        match query.from_period() {
            None => to,
            Some(from) => to - self.balance(entity, from.pred(), filters, book),
        }
    }

    async fn begin(&self, call: BackendCall) -> Result<(), FetchError> {
        let failure = {
            let mut script = self.script.lock();
            script.calls.push(call);
            script.fail_next.pop_front().or(script.fail_all)
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match failure {
            Some(kind) => Err(FetchError::new(kind).with_message("scripted failure")),
            None => Ok(()),
        }
    }

    fn is_omitted(&self, entity: &EntityId) -> bool {
        self.script.lock().omitted.contains(entity)
    }
}

fn model_delta(entity: &EntityId, period: Period, filters: &DimensionFilters, book: BookId) -> f64 {
    let seed: u32 = entity.as_str().bytes().map(u32::from).sum();
    let filter_weight: u32 = filters
        .iter()
        .flat_map(|(k, v)| k.bytes().chain(v.bytes()))
        .map(u32::from)
        .sum();
    let raw = seed * 7
        + period.month() * 31
        + (period.year() as u32 % 100) * 11
        + filter_weight * 3
        + book.0 * 101;
    // Some periods are net outflows.
    if raw % 5 == 0 {
        -f64::from(raw % 1000)
    } else {
        f64::from(raw % 1000)
    }
}

#[async_trait]
impl AccountingBackend for MockBackend {
    async fn opening_values(
        &self,
        request: &OpeningValuesRequest,
    ) -> Result<EntityValues, FetchError> {
        self.begin(BackendCall::OpeningValues(request.clone())).await?;
        Ok(request
            .entities
            .iter()
            .filter(|e| !self.is_omitted(e))
            .map(|e| {
                let v = self.balance(e, request.anchor, &request.filters, request.book);
                (e.clone(), v)
            })
            .collect())
    }

    async fn period_deltas(
        &self,
        request: &PeriodDeltasRequest,
    ) -> Result<EntityPeriodValues, FetchError> {
        self.begin(BackendCall::PeriodDeltas(request.clone())).await?;
        Ok(request
            .entities
            .iter()
            .filter(|e| !self.is_omitted(e))
            .map(|e| {
                let per_period = Period::range_inclusive(request.from, request.to)
                    .map(|p| (p, self.delta(e, p, &request.filters, request.book)))
                    .collect();
                (e.clone(), per_period)
            })
            .collect())
    }

    async fn single_value(&self, query: &BalanceQuery) -> Result<f64, FetchError> {
        self.begin(BackendCall::SingleValue(query.clone())).await?;
        Ok(self.expected(query))
    }
}
