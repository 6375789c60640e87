//! Safety ceilings on grid size.
//!
//! A rejection is a routing decision, not an error: the whole group goes to the
//! individual path unmodified.

use crate::config::SafetyLimits;
use crate::grid::GridDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    Entities { count: usize, max: usize },
    Periods { count: usize, max: usize },
    /// The period-deltas call would cover more months than the period ceiling.
    Span { months: usize, max: usize },
}

impl std::fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitExceeded::Entities { count, max } => {
                write!(f, "{count} entities exceeds the ceiling of {max}")
            }
            LimitExceeded::Periods { count, max } => {
                write!(f, "{count} periods exceeds the ceiling of {max}")
            }
            LimitExceeded::Span { months, max } => {
                write!(f, "{months}-month delta span exceeds the ceiling of {max}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Accept,
    Reject(LimitExceeded),
}

impl LimitDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, LimitDecision::Accept)
    }
}

#[derive(Debug, Clone)]
pub struct SafetyLimiter {
    limits: SafetyLimits,
}

impl SafetyLimiter {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn check(&self, grid: &GridDescriptor) -> LimitDecision {
        let entities = grid.entity_count();
        if entities > self.limits.max_entities {
            return LimitDecision::Reject(LimitExceeded::Entities {
                count: entities,
                max: self.limits.max_entities,
            });
        }
        let periods = grid.period_count();
        if periods > self.limits.max_periods {
            return LimitDecision::Reject(LimitExceeded::Periods {
                count: periods,
                max: self.limits.max_periods,
            });
        }
        let months = grid.delta_span();
        if months > self.limits.max_periods {
            return LimitDecision::Reject(LimitExceeded::Span {
                months,
                max: self.limits.max_periods,
            });
        }
        LimitDecision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::detect_grids;
    use crate::ledger::PendingRequest;
    use cellfetch_common::{BalanceQuery, Period, QueryFingerprint};

    fn grid(entities: usize, months: u32) -> GridDescriptor {
        let from = Period::new(2020, 1).unwrap();
        let mut reqs = Vec::new();
        for e in 0..entities {
            let mut to = from;
            for _ in 0..months {
                to = to.succ();
                let query = BalanceQuery::activity(format!("{e}"), from, to).unwrap();
                reqs.push(PendingRequest {
                    fingerprint: query.fingerprint(),
                    query,
                });
            }
        }
        detect_grids(&reqs).grids.remove(0).descriptor
    }

    #[test]
    fn at_the_ceiling_is_accepted() {
        let limiter = SafetyLimiter::new(SafetyLimits::default());
        // 200 entities; `from` plus 35 distinct `to` periods = 36
        assert!(limiter.check(&grid(200, 35)).is_accept());
    }

    #[test]
    fn above_either_ceiling_is_rejected() {
        let limiter = SafetyLimiter::new(SafetyLimits::default());
        assert_eq!(
            limiter.check(&grid(201, 1)),
            LimitDecision::Reject(LimitExceeded::Entities {
                count: 201,
                max: 200
            })
        );
        assert_eq!(
            limiter.check(&grid(2, 36)),
            LimitDecision::Reject(LimitExceeded::Periods { count: 37, max: 36 })
        );
    }

    #[test]
    fn wide_span_with_few_endpoints_is_rejected() {
        let from = Period::new(2000, 1).unwrap();
        let to = Period::new(2025, 12).unwrap();
        let reqs: Vec<_> = ["4000", "4100"]
            .into_iter()
            .map(|e| {
                let query = BalanceQuery::activity(e, from, to).unwrap();
                PendingRequest {
                    fingerprint: query.fingerprint(),
                    query,
                }
            })
            .collect();
        let descriptor = detect_grids(&reqs).grids.remove(0).descriptor;
        assert_eq!(descriptor.period_count(), 2);

        let limiter = SafetyLimiter::new(SafetyLimits::default());
        assert_eq!(
            limiter.check(&descriptor),
            LimitDecision::Reject(LimitExceeded::Span { months: 312, max: 36 })
        );
    }

    #[test]
    fn ceilings_are_configurable() {
        let limiter = SafetyLimiter::new(SafetyLimits {
            max_entities: 500,
            max_periods: 36,
        });
        assert!(limiter.check(&grid(201, 1)).is_accept());
    }
}
