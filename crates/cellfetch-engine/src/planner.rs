//! Per-tick dispatch planning: batch vs individual.

use cellfetch_common::Fingerprint;

use crate::config::SafetyLimits;
use crate::grid::{GridDescriptor, detect_in, partition};
use crate::ledger::PendingRequest;
use crate::limiter::{LimitDecision, LimitExceeded, SafetyLimiter};

/// One accepted grid and everything it will resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub descriptor: GridDescriptor,
    pub batch_fingerprint: Fingerprint,
    /// The period-activity requests that formed the grid.
    pub members: Vec<PendingRequest>,
    /// Cumulative and single-period requests the grid's balances also answer.
    pub riders: Vec<PendingRequest>,
}

impl BatchPlan {
    pub fn requests(&self) -> impl Iterator<Item = &PendingRequest> {
        self.members.iter().chain(self.riders.iter())
    }

    pub fn len(&self) -> usize {
        self.members.len() + self.riders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedGrid {
    pub descriptor: GridDescriptor,
    pub reason: LimitExceeded,
}

/// Every claimed request lands in exactly one of `batches` or `individual`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchPlan {
    pub batches: Vec<BatchPlan>,
    pub individual: Vec<PendingRequest>,
    pub rejected: Vec<RejectedGrid>,
}

impl DispatchPlan {
    pub fn batched_count(&self) -> usize {
        self.batches.iter().map(BatchPlan::len).sum()
    }

    pub fn total(&self) -> usize {
        self.batched_count() + self.individual.len()
    }
}

/// Planner for one coalescing tick
#[derive(Debug, Clone)]
pub struct DispatchPlanner {
    limiter: SafetyLimiter,
    batching_enabled: bool,
}

impl DispatchPlanner {
    pub fn new(limits: SafetyLimits, batching_enabled: bool) -> Self {
        Self {
            limiter: SafetyLimiter::new(limits),
            batching_enabled,
        }
    }

    pub fn plan(&self, requests: Vec<PendingRequest>) -> DispatchPlan {
        if !self.batching_enabled {
            return DispatchPlan {
                individual: requests,
                ..Default::default()
            };
        }

        let part = partition(&requests);
        let detection = detect_in(&requests, &part.period_activity);

        // index -> destination; None means individual
        let mut slot: Vec<Option<(usize, bool)>> = vec![None; requests.len()];
        let mut accepted: Vec<GridDescriptor> = Vec::new();
        let mut rejected = Vec::new();

        for candidate in detection.grids {
            match self.limiter.check(&candidate.descriptor) {
                LimitDecision::Accept => {
                    let batch = accepted.len();
                    for idx in candidate.members {
                        slot[idx] = Some((batch, false));
                    }
                    accepted.push(candidate.descriptor);
                }
                LimitDecision::Reject(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        filters = %candidate.descriptor.filters_fingerprint,
                        requests = candidate.members.len(),
                        %reason,
                        "grid rejected by safety limits, falling back to individual fetches"
                    );
                    rejected.push(RejectedGrid {
                        descriptor: candidate.descriptor,
                        reason,
                    });
                }
            }
        }

        for idx in part.cumulative.iter().chain(part.ranged.iter()) {
            let query = &requests[*idx].query;
            if let Some(batch) = accepted.iter().position(|g| g.covers(query)) {
                slot[*idx] = Some((batch, true));
            }
        }

        let mut batches: Vec<BatchPlan> = accepted
            .into_iter()
            .map(|descriptor| BatchPlan {
                batch_fingerprint: descriptor.batch_fingerprint(),
                descriptor,
                members: Vec::new(),
                riders: Vec::new(),
            })
            .collect();
        let mut individual = Vec::new();
        for (req, dest) in requests.into_iter().zip(slot) {
            match dest {
                Some((batch, false)) => batches[batch].members.push(req),
                Some((batch, true)) => batches[batch].riders.push(req),
                None => individual.push(req),
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            batches = batches.len(),
            batched = batches.iter().map(BatchPlan::len).sum::<usize>(),
            individual = individual.len(),
            rejected = rejected.len(),
            "dispatch plan"
        );

        DispatchPlan {
            batches,
            individual,
            rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellfetch_common::{BalanceQuery, Period, QueryFingerprint};

    fn p(y: i32, m: u32) -> Period {
        Period::new(y, m).unwrap()
    }

    fn req(query: BalanceQuery) -> PendingRequest {
        PendingRequest {
            fingerprint: query.fingerprint(),
            query,
        }
    }

    fn ytd(entity: &str, to: Period) -> PendingRequest {
        req(BalanceQuery::activity(entity, p(2024, 12), to).unwrap())
    }

    fn planner() -> DispatchPlanner {
        DispatchPlanner::new(SafetyLimits::default(), true)
    }

    #[test]
    fn grid_members_and_riders_are_batched() {
        let reqs = vec![
            ytd("A", p(2025, 1)),
            req(BalanceQuery::cumulative("A", p(2025, 2)).unwrap()),
            ytd("A", p(2025, 2)),
            ytd("B", p(2025, 1)),
            req(BalanceQuery::cumulative("Z", p(2025, 2)).unwrap()),
            ytd("B", p(2025, 2)),
        ];
        let plan = planner().plan(reqs);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].members.len(), 4);
        assert_eq!(plan.batches[0].riders.len(), 1);
        assert_eq!(plan.individual.len(), 1);
        assert_eq!(plan.individual[0].query.entity().as_str(), "Z");
        assert_eq!(plan.total(), 6);
    }

    #[test]
    fn rejected_grid_goes_individual_whole() {
        let mut reqs: Vec<_> = (0..201).map(|e| ytd(&e.to_string(), p(2025, 1))).collect();
        reqs.push(req(BalanceQuery::cumulative("0", p(2025, 1)).unwrap()));
        let plan = planner().plan(reqs);
        assert!(plan.batches.is_empty());
        assert_eq!(plan.individual.len(), 202);
        assert_eq!(plan.rejected.len(), 1);
        assert!(matches!(
            plan.rejected[0].reason,
            LimitExceeded::Entities { count: 201, .. }
        ));
    }

    #[test]
    fn individual_only_never_rides() {
        let reqs = vec![
            ytd("A", p(2025, 1)),
            ytd("B", p(2025, 2)),
            req(BalanceQuery::cumulative("A", p(2025, 1))
                .unwrap()
                .individual_only()),
        ];
        let plan = planner().plan(reqs);
        assert_eq!(plan.batched_count(), 2);
        assert_eq!(plan.individual.len(), 1);
    }

    #[test]
    fn batching_switch_off_sends_everything_individual() {
        let reqs = vec![ytd("A", p(2025, 1)), ytd("B", p(2025, 2))];
        let plan = DispatchPlanner::new(SafetyLimits::default(), false).plan(reqs);
        assert!(plan.batches.is_empty());
        assert_eq!(plan.individual.len(), 2);
    }
}
