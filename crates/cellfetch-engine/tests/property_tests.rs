//! Property-based tests for grid planning invariants.
//!
//! Random request mixes are planned and, for the async properties, executed against
//! the scripted backend on a current-thread runtime.

use std::collections::BTreeSet;
use std::sync::Arc;

use cellfetch_common::{AccountingBackend, BalanceQuery, ManualClock, Period, QueryFingerprint};
use cellfetch_engine::ledger::PendingRequest;
use cellfetch_engine::{Coalescer, DispatchPlanner, EngineConfig, SafetyLimits, detect_grids};
use cellfetch_testkit::MockBackend;
use futures::future::join_all;
use proptest::prelude::*;

const ENTITIES: [&str; 5] = ["4000", "4100", "4200", "5000", "6100"];

fn base() -> Period {
    Period::new(2024, 1).unwrap()
}

fn nth(offset: u32) -> Period {
    (0..offset).fold(base(), |p, _| p.succ())
}

/// Any of the three request shapes over a two-year window.
fn arb_query() -> impl Strategy<Value = BalanceQuery> {
    (0..ENTITIES.len(), 0u32..24, 0u32..6, 0u8..3).prop_map(|(e, to, span, shape)| {
        let entity = ENTITIES[e];
        let to = nth(to);
        match shape {
            0 => BalanceQuery::cumulative(entity, to).unwrap(),
            1 => BalanceQuery::activity(entity, to, to).unwrap(),
            _ => {
                let from = (0..span).fold(to, |p, _| p.pred());
                BalanceQuery::activity(entity, from, to).unwrap()
            }
        }
    })
}

fn arb_requests() -> impl Strategy<Value = Vec<PendingRequest>> {
    prop::collection::vec(arb_query(), 1..40).prop_map(|queries| {
        let mut seen = BTreeSet::new();
        queries
            .into_iter()
            .filter(|q| seen.insert(q.fingerprint()))
            .map(|query| PendingRequest {
                fingerprint: query.fingerprint(),
                query,
            })
            .collect()
    })
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn detection_ignores_arrival_order(requests in arb_requests()) {
        let mut reversed = requests.clone();
        reversed.reverse();

        let forward: Vec<_> = detect_grids(&requests).grids.into_iter().map(|g| g.descriptor).collect();
        let backward: Vec<_> = detect_grids(&reversed).grids.into_iter().map(|g| g.descriptor).collect();
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn every_request_is_planned_exactly_once(requests in arb_requests(), max_entities in 2usize..6) {
        let planner = DispatchPlanner::new(
            SafetyLimits { max_entities, max_periods: 36 },
            true,
        );
        let all: BTreeSet<_> = requests.iter().map(|r| r.fingerprint.clone()).collect();
        let plan = planner.plan(requests.clone());

        let mut planned = Vec::new();
        for batch in &plan.batches {
            prop_assert!(batch.descriptor.entity_count() <= max_entities);
            for rider in &batch.riders {
                prop_assert!(batch.descriptor.covers(&rider.query));
            }
            planned.extend(batch.requests().map(|r| r.fingerprint.clone()));
        }
        planned.extend(plan.individual.iter().map(|r| r.fingerprint.clone()));

        prop_assert_eq!(planned.len(), requests.len());
        prop_assert_eq!(planned.into_iter().collect::<BTreeSet<_>>(), all);
    }

    #[test]
    fn batched_values_match_single_value_answers(requests in arb_requests()) {
        let backend = Arc::new(MockBackend::new());
        let dyn_backend: Arc<dyn AccountingBackend> = backend.clone();
        let engine = Coalescer::with_clock(
            EngineConfig::default(),
            dyn_backend,
            None,
            Arc::new(ManualClock::new(0)),
        );
        let queries: Vec<BalanceQuery> = requests.into_iter().map(|r| r.query).collect();

        let values = block_on(async {
            let pending: Vec<_> = queries.iter().cloned().map(|q| engine.submit(q)).collect();
            engine.flush().await;
            join_all(pending).await
        });
        for (query, value) in queries.iter().zip(values) {
            prop_assert_eq!(value.unwrap(), backend.expected(query));
        }
    }
}
