//! Preload coordination across execution contexts.
//!
//! The durable store holds the single source of truth: a [`PreloadState`] and the
//! latest merged [`TriggerPayload`]. Contexts never assume a read-modify-write is
//! atomic, so every update is a union: periods and targets merge in, nothing is
//! overwritten away. In-process bookkeeping (seen periods, known targets, the
//! completion watch) only avoids redundant store traffic and is re-validated
//! against the store after every wait.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use cellfetch_common::{
    AccountingBackend, BalanceQuery, BookId, Clock, DimensionFilters, DurableStore, EntityId,
    FetchError, OpeningValuesRequest, Period, PeriodDeltasRequest, QueryFingerprint, StoreError,
    filters_fingerprint,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::cache::TieredCache;
use crate::config::PreloadConfig;
use crate::metrics::EngineMetrics;

pub const PRELOAD_STATE_KEY: &str = "cellfetch:v1:preload:state";
pub const PRELOAD_TRIGGER_KEY: &str = "cellfetch:v1:preload:trigger";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadStatus {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadState {
    pub status: PreloadStatus,
    pub triggered_periods: BTreeSet<Period>,
    pub started_at_ms: Option<i64>,
    pub completed_periods: BTreeSet<Period>,
    pub updated_at_ms: i64,
}

impl PreloadState {
    /// Running and not yet past the staleness ceiling.
    pub fn is_active(&self, now_ms: i64, stale_after: Duration) -> bool {
        self.status == PreloadStatus::Running
            && self
                .started_at_ms
                .is_some_and(|at| now_ms < at.saturating_add(stale_after.as_millis() as i64))
    }
}

/// One entity under one filter set: the unit a preload warms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreloadTarget {
    pub entity: EntityId,
    #[serde(default)]
    pub filters: DimensionFilters,
    #[serde(default)]
    pub book: BookId,
}

impl PreloadTarget {
    pub fn of(query: &BalanceQuery) -> Self {
        Self {
            entity: query.entity().clone(),
            filters: query.filters().clone(),
            book: query.book(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    NewPeriod,
    ScopedRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub targets: BTreeSet<PreloadTarget>,
    pub periods: BTreeSet<Period>,
    pub reason: TriggerReason,
    pub timestamp_ms: i64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Idle (or stale) state moved to running with a fresh payload.
    Started,
    /// Periods and targets were merged into the running trigger.
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The period was marked completed.
    Completed,
    /// No running preload covers the period (never triggered, abandoned or stale).
    NotPending,
    /// The ceiling elapsed while the period was still pending.
    TimedOut,
}

#[derive(Default)]
struct LocalBook {
    seen_periods: BTreeSet<Period>,
    targets: BTreeSet<PreloadTarget>,
}

pub struct PreloadCoordinator {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: PreloadConfig,
    metrics: Arc<EngineMetrics>,
    local: Mutex<LocalBook>,
    completions: watch::Sender<u64>,
}

impl PreloadCoordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        config: PreloadConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            store,
            clock,
            config,
            metrics,
            local: Mutex::new(LocalBook::default()),
            completions,
        }
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    pub fn load_state(&self) -> Result<PreloadState, StoreError> {
        Ok(read_json(&*self.store, PRELOAD_STATE_KEY)?.unwrap_or_default())
    }

    pub fn latest_trigger(&self) -> Result<Option<TriggerPayload>, StoreError> {
        read_json(&*self.store, PRELOAD_TRIGGER_KEY)
    }

    /// Note a cache miss. The first miss for a period that this context has not seen
    /// and that the store does not list as completed emits a new-period trigger.
    /// A target first seen for a period that is already pending is merged into the
    /// running trigger so the worker warms the whole entity set.
    pub fn observe(&self, query: &BalanceQuery) -> Option<TriggerOutcome> {
        let period = query.to_period();
        let target = PreloadTarget::of(query);
        // `None` when the period is already seen and only the target may be new.
        let known = {
            let mut local = self.local.lock();
            let new_target = local.targets.insert(target.clone());
            if !local.seen_periods.contains(&period) {
                Some(local.targets.clone())
            } else if new_target {
                None
            } else {
                return None;
            }
        };

        let state = match self.load_state() {
            Ok(state) => state,
            Err(_err) => {
                self.metrics.record_store_error();
                #[cfg(feature = "tracing")]
                tracing::warn!(%period, error = %_err, "preload state unreadable, skipping trigger");
                if known.is_none() {
                    self.local.lock().targets.remove(&target);
                }
                return None;
            }
        };

        let Some(targets) = known else {
            if !self.pending_in(&state, period) {
                return None;
            }
            let outcome = self.publish(period, BTreeSet::from([target.clone()]));
            if outcome.is_none() {
                self.local.lock().targets.remove(&target);
            }
            return outcome;
        };
        if state.completed_periods.contains(&period) {
            self.local.lock().seen_periods.insert(period);
            return None;
        }
        let outcome = self.publish(period, targets)?;
        self.local.lock().seen_periods.insert(period);
        Some(outcome)
    }

    fn publish(&self, period: Period, targets: BTreeSet<PreloadTarget>) -> Option<TriggerOutcome> {
        match self.trigger(&[period], targets, TriggerReason::NewPeriod) {
            Ok(outcome) => Some(outcome),
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%period, error = %_err, "preload trigger failed");
                None
            }
        }
    }

    /// Start a preload for `periods`, or merge them into the running one.
    pub fn trigger(
        &self,
        periods: &[Period],
        targets: BTreeSet<PreloadTarget>,
        reason: TriggerReason,
    ) -> Result<TriggerOutcome, FetchError> {
        let now = self.clock.now_millis();
        let mut state = self.healing(self.load_state())?.unwrap_or_default();
        let previous = self.healing(self.latest_trigger())?.flatten();

        let outcome = if state.is_active(now, self.config.stale_after()) {
            TriggerOutcome::Merged
        } else {
            state.status = PreloadStatus::Running;
            state.started_at_ms = Some(now);
            state.triggered_periods.clear();
            TriggerOutcome::Started
        };
        for period in periods {
            state.triggered_periods.insert(*period);
            // A re-triggered period is pending again until a worker completes it.
            state.completed_periods.remove(period);
        }
        state.updated_at_ms = now;

        let sequence = previous.as_ref().map_or(0, |p| p.sequence) + 1;
        let payload = match (outcome, previous) {
            (TriggerOutcome::Merged, Some(mut prev)) => {
                prev.periods.extend(periods.iter().copied());
                prev.targets.extend(targets);
                prev.reason = reason;
                prev.timestamp_ms = now;
                prev.sequence = sequence;
                prev
            }
            _ => TriggerPayload {
                targets,
                periods: periods.iter().copied().collect(),
                reason,
                timestamp_ms: now,
                sequence,
            },
        };

        self.write_state(&state)?;
        write_json(&*self.store, PRELOAD_TRIGGER_KEY, &payload).inspect_err(|_| {
            self.metrics.record_store_error();
        })?;
        self.metrics
            .record_preload_trigger(outcome == TriggerOutcome::Merged);

        #[cfg(feature = "tracing")]
        tracing::info!(
            ?outcome,
            ?reason,
            periods = ?payload.periods,
            targets = payload.targets.len(),
            sequence,
            "preload trigger published"
        );
        Ok(outcome)
    }

    /// Trigger scoped to one request's own period and target.
    pub fn scoped_retrigger(&self, query: &BalanceQuery) -> Result<TriggerOutcome, FetchError> {
        self.trigger(
            &[query.to_period()],
            BTreeSet::from([PreloadTarget::of(query)]),
            TriggerReason::ScopedRetry,
        )
    }

    /// Whether a live preload is responsible for `period` right now.
    pub fn is_pending(&self, period: Period) -> bool {
        match self.load_state() {
            Ok(state) => self.pending_in(&state, period),
            Err(_) => false,
        }
    }

    fn pending_in(&self, state: &PreloadState, period: Period) -> bool {
        state.is_active(self.clock.now_millis(), self.config.stale_after())
            && state.triggered_periods.contains(&period)
            && !state.completed_periods.contains(&period)
    }

    /// Mark `periods` warmed. The state returns to idle once nothing is left pending.
    pub fn complete(&self, periods: &[Period]) -> Result<(), FetchError> {
        self.finish(periods, true)
    }

    /// Give up on `periods` without marking them warmed so waiters fall back promptly.
    pub fn abandon(&self, periods: &[Period]) -> Result<(), FetchError> {
        self.finish(periods, false)
    }

    fn finish(&self, periods: &[Period], completed: bool) -> Result<(), FetchError> {
        let now = self.clock.now_millis();
        let mut state = self.healing(self.load_state())?.unwrap_or_default();
        for period in periods {
            state.triggered_periods.remove(period);
            if completed {
                state.completed_periods.insert(*period);
            }
        }
        if state.triggered_periods.is_empty() {
            state.status = PreloadStatus::Idle;
            state.started_at_ms = None;
        }
        state.updated_at_ms = now;
        self.write_state(&state)?;
        self.completions.send_modify(|n| *n += 1);

        #[cfg(feature = "tracing")]
        tracing::info!(?periods, completed, status = ?state.status, "preload periods finished");
        Ok(())
    }

    /// Wait, at most `timeout`, for a preload covering `period` to finish. Wakes on
    /// local completions and re-reads the store every recheck interval so that
    /// completions written by other contexts are seen too.
    pub async fn wait_for(&self, period: Period, timeout: Duration) -> WaitOutcome {
        let mut rx = self.completions.subscribe();
        let recheck = self.config.recheck_interval();
        let poll = async {
            loop {
                match self.load_state() {
                    Ok(state) if state.completed_periods.contains(&period)
                        && !state.triggered_periods.contains(&period) =>
                    {
                        return WaitOutcome::Completed;
                    }
                    Ok(state) if self.pending_in(&state, period) => {}
                    _ => return WaitOutcome::NotPending,
                }
                tokio::select! {
                    _ = rx.changed() => {}
                    _ = tokio::time::sleep(recheck) => {}
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or(WaitOutcome::TimedOut);
        self.metrics
            .record_preload_wait(outcome == WaitOutcome::TimedOut);
        outcome
    }

    /// Corrupt entries are overwritten by the next write, so writers read them as
    /// absent. Any other store failure is propagated.
    fn healing<T>(&self, read: Result<T, StoreError>) -> Result<Option<T>, FetchError> {
        match read {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                self.metrics.record_store_error();
                match err {
                    StoreError::Corrupt { .. } => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %err, "replacing corrupt preload entry");
                        Ok(None)
                    }
                    other => Err(other.into()),
                }
            }
        }
    }

    fn write_state(&self, state: &PreloadState) -> Result<(), FetchError> {
        write_json(&*self.store, PRELOAD_STATE_KEY, state).inspect_err(|_| {
            self.metrics.record_store_error();
        })
    }
}

fn read_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

fn write_json<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) -> Result<(), FetchError> {
    let bytes = serde_json::to_vec(value).map_err(|e| FetchError::internal(e.to_string()))?;
    store.set(key, bytes, None)?;
    Ok(())
}

/// What one worker pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub periods_completed: Vec<Period>,
    pub values_written: usize,
    pub backend_calls: usize,
}

/// Reference warm-up worker. Typically runs in a different context from the
/// engines that trigger it, sharing only the durable store.
pub struct PreloadWorker {
    backend: Arc<dyn AccountingBackend>,
    cache: Arc<TieredCache>,
    coordinator: Arc<PreloadCoordinator>,
    metrics: Arc<EngineMetrics>,
}

impl PreloadWorker {
    pub fn new(
        backend: Arc<dyn AccountingBackend>,
        cache: Arc<TieredCache>,
        coordinator: Arc<PreloadCoordinator>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            backend,
            cache,
            coordinator,
            metrics,
        }
    }

    /// Warm every pending period of the latest trigger. For each period and filter
    /// group: one opening-values call (cumulative balances as of the period) and one
    /// period-deltas call (that period's activity). A failure abandons the periods
    /// not yet completed and is returned.
    pub async fn run_once(&self) -> Result<PreloadReport, FetchError> {
        let mut report = PreloadReport::default();
        let Some(payload) = self.coordinator.latest_trigger()? else {
            return Ok(report);
        };
        let state = self.coordinator.load_state()?;
        let periods: Vec<Period> = payload
            .periods
            .iter()
            .copied()
            .filter(|p| self.coordinator.pending_in(&state, *p))
            .collect();
        if periods.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<_, (DimensionFilters, BookId, Vec<EntityId>)> = BTreeMap::new();
        for target in &payload.targets {
            groups
                .entry(filters_fingerprint(&target.filters, target.book))
                .or_insert_with(|| (target.filters.clone(), target.book, Vec::new()))
                .2
                .push(target.entity.clone());
        }

        for (idx, period) in periods.iter().enumerate() {
            for (filters, book, entities) in groups.values() {
                match self.warm(*period, filters, *book, entities).await {
                    Ok(written) => {
                        report.values_written += written;
                        report.backend_calls += 2;
                    }
                    Err(err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%period, error = %err, "preload failed, abandoning remaining periods");
                        if let Err(_abandon_err) = self.coordinator.abandon(&periods[idx..]) {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %_abandon_err, "could not record preload abandonment");
                        }
                        return Err(err);
                    }
                }
            }
            self.coordinator.complete(&[*period])?;
            report.periods_completed.push(*period);
        }
        Ok(report)
    }

    async fn warm(
        &self,
        period: Period,
        filters: &DimensionFilters,
        book: BookId,
        entities: &[EntityId],
    ) -> Result<usize, FetchError> {
        let opening = self
            .backend
            .opening_values(&OpeningValuesRequest {
                entities: entities.to_vec(),
                anchor: period,
                filters: filters.clone(),
                book,
            })
            .await;
        self.metrics.record_backend_call(opening.is_ok());
        let opening = opening?;
        let deltas = self
            .backend
            .period_deltas(&PeriodDeltasRequest {
                entities: entities.to_vec(),
                from: period,
                to: period,
                filters: filters.clone(),
                book,
            })
            .await;
        self.metrics.record_backend_call(deltas.is_ok());
        let deltas = deltas?;

        let mut values = Vec::with_capacity(entities.len() * 2);
        for entity in entities {
            let balance = opening.get(entity).copied().filter(|v| v.is_finite());
            let activity = deltas
                .get(entity)
                .and_then(|m| m.get(&period))
                .copied()
                .filter(|v| v.is_finite());
            let (Some(balance), Some(activity)) = (balance, activity) else {
                return Err(FetchError::shape(format!(
                    "preload response missing a finite value for {entity} / {period}"
                )));
            };
            let cumulative = BalanceQuery::cumulative(entity.clone(), period)?
                .with_filters(filters.clone())
                .with_book(book);
            let ranged = BalanceQuery::activity(entity.clone(), period, period)?
                .with_filters(filters.clone())
                .with_book(book);
            values.push((cumulative.fingerprint(), balance));
            values.push((ranged.fingerprint(), activity));
        }
        // Only write once the whole group validated.
        for (fingerprint, value) in &values {
            self.cache.put(fingerprint, *value);
        }
        Ok(values.len())
    }
}
