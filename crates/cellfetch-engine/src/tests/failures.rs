use cellfetch_common::{FetchErrorKind, QueryFingerprint};
use cellfetch_testkit::fixtures::{activity, cumulative, entity_names, period, ytd_grid};
use futures::future::join_all;

use super::common::harness;
use crate::config::{EngineConfig, SafetyLimits};

#[tokio::test]
async fn backend_failure_reaches_every_caller_and_is_not_cached() {
    let h = harness(EngineConfig::default());
    h.backend.fail_all(Some(FetchErrorKind::Server));
    let queries = ytd_grid(
        &["4000", "4100"],
        period(2024, 12),
        &[period(2025, 1), period(2025, 2)],
    );
    let pending: Vec<_> = queries.iter().cloned().map(|q| h.engine.submit(q)).collect();
    h.engine.flush().await;

    for result in join_all(pending).await {
        assert_eq!(result.unwrap_err().kind, FetchErrorKind::Server);
    }
    assert_eq!(h.engine.pending_len(), 0);
    assert_eq!(h.engine.cache().local_len(), 0);
    assert!(h.engine.metrics().backend_errors >= 1);

    // The next tick starts from scratch.
    h.backend.fail_all(None);
    let pending: Vec<_> = queries.iter().cloned().map(|q| h.engine.submit(q)).collect();
    h.engine.flush().await;
    for (query, value) in queries.iter().zip(join_all(pending).await) {
        assert_eq!(value.unwrap(), h.backend.expected(query));
    }
}

#[tokio::test]
async fn missing_entity_in_bulk_response_is_a_shape_error() {
    let h = harness(EngineConfig::default());
    h.backend.omit_entity("4100");
    let queries = ytd_grid(
        &["4000", "4100"],
        period(2024, 12),
        &[period(2025, 1), period(2025, 2)],
    );
    let pending: Vec<_> = queries.iter().cloned().map(|q| h.engine.submit(q)).collect();
    h.engine.flush().await;

    // Nothing is coerced to zero, not even for the entity that was present.
    for result in join_all(pending).await {
        assert_eq!(result.unwrap_err().kind, FetchErrorKind::Shape);
    }
    assert_eq!(h.engine.cache().local_len(), 0);
}

#[tokio::test]
async fn non_finite_single_value_is_a_shape_error() {
    let h = harness_nan();
    let q = cumulative("4000", period(2025, 1));
    let pending = h.engine.submit(q.clone());
    h.engine.flush().await;
    assert_eq!(pending.await.unwrap_err().kind, FetchErrorKind::Shape);
    assert!(!h.engine.cache().recheck(&q.fingerprint()).is_present());
}

fn harness_nan() -> super::common::Harness {
    super::common::harness_with(
        EngineConfig::default(),
        cellfetch_testkit::MockBackend::new().with_delta("4000", period(2025, 1), f64::NAN),
    )
}

#[tokio::test]
async fn oversized_grid_falls_back_to_individual_fetches() {
    let h = harness(EngineConfig::default());
    let names = entity_names(201);
    let queries: Vec<_> = names
        .iter()
        .map(|e| activity(e, period(2024, 12), period(2025, 1)))
        .collect();
    let pending: Vec<_> = queries.iter().cloned().map(|q| h.engine.submit(q)).collect();

    let report = h.engine.flush().await;
    assert_eq!(report.rejected_grids, 1);
    assert_eq!(report.batches, 0);
    assert_eq!(report.individual, 201);
    for (query, value) in queries.iter().zip(join_all(pending).await) {
        assert_eq!(value.unwrap(), h.backend.expected(query));
    }
    assert_eq!(h.backend.bulk_calls(), 0);
    assert_eq!(h.backend.single_calls(), 201);
    assert_eq!(h.engine.metrics().grids_rejected, 1);
}

#[tokio::test]
async fn grid_at_the_ceiling_is_still_batched() {
    let h = harness(EngineConfig {
        limits: SafetyLimits {
            max_entities: 3,
            max_periods: 3,
        },
        ..Default::default()
    });
    let queries = ytd_grid(
        &["4000", "4100", "4200"],
        period(2024, 12),
        &[period(2025, 1), period(2025, 2)],
    );
    let pending: Vec<_> = queries.iter().cloned().map(|q| h.engine.submit(q)).collect();
    let report = h.engine.flush().await;
    assert_eq!(report.batches, 1);
    join_all(pending).await;
    assert_eq!(h.backend.single_calls(), 0);
}

#[tokio::test]
async fn individual_failure_does_not_affect_other_requests() {
    let h = harness(EngineConfig {
        batching_enabled: false,
        ..Default::default()
    });
    let ok = cumulative("4000", period(2025, 1));
    let bad = cumulative("4100", period(2025, 1));
    let a = h.engine.submit(ok.clone());
    // Exactly one of the two backend calls fails.
    h.backend.fail_next(FetchErrorKind::RateLimited);
    let b = h.engine.submit(bad);
    h.engine.flush().await;

    let results = [a.await, b.await];
    let failed = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(failed, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(e) if e.kind == FetchErrorKind::RateLimited
    )));
}

#[tokio::test]
async fn shutdown_cancels_waiting_callers() {
    let h = harness(EngineConfig::default());
    let a = h.engine.submit(cumulative("4000", period(2025, 1)));
    let b = h.engine.submit(cumulative("4100", period(2025, 1)));
    assert_eq!(h.engine.shutdown(), 2);
    assert_eq!(a.await.unwrap_err().kind, FetchErrorKind::Cancelled);
    assert_eq!(b.await.unwrap_err().kind, FetchErrorKind::Cancelled);
    assert_eq!(h.backend.total_calls(), 0);
}

#[tokio::test]
async fn durable_store_outage_degrades_to_local_cache() {
    let h = harness(EngineConfig::default());
    h.store.set_offline(true);
    let q = cumulative("4000", period(2025, 1));
    let pending = h.engine.submit(q.clone());
    h.engine.flush().await;
    assert_eq!(pending.await.unwrap(), h.backend.expected(&q));

    let mut again = h.engine.submit(q);
    assert!(again.try_take().is_some());
    assert_eq!(h.backend.total_calls(), 1);
    assert!(h.engine.metrics().store_errors > 0);
}
