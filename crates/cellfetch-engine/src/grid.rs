//! Grid pattern detection and anchor resolution.
//!
//! Detection is a pure reduction over a ledger snapshot: requests are grouped by
//! filters fingerprint, and a group whose period-activity requests span at least two
//! entities and two periods becomes a grid. Earliest/latest bounds use period
//! ordering, so the result never depends on the order requests arrived in.

use std::collections::{BTreeMap, BTreeSet};

use cellfetch_common::{
    BalanceQuery, BookId, DimensionFilters, EntityId, Fingerprint, Period, RequestShape, Routing,
    batch_fingerprint, filters_fingerprint,
};

use crate::ledger::PendingRequest;

/// Indexes into a request snapshot, by how each request may be served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub cumulative: Vec<usize>,
    pub period_activity: Vec<usize>,
    pub ranged: Vec<usize>,
    pub individual_only: Vec<usize>,
}

pub fn partition(requests: &[PendingRequest]) -> Partition {
    let mut out = Partition::default();
    for (idx, req) in requests.iter().enumerate() {
        if req.query.routing() == Routing::IndividualOnly {
            out.individual_only.push(idx);
            continue;
        }
        match req.query.shape() {
            RequestShape::Cumulative => out.cumulative.push(idx),
            RequestShape::PeriodActivity => out.period_activity.push(idx),
            RequestShape::Ranged => out.ranged.push(idx),
        }
    }
    out
}

/// An entity × period grid found in one snapshot. Rebuilt on every tick, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridDescriptor {
    pub entities: BTreeSet<EntityId>,
    /// Distinct from/to endpoints of the grid's requests.
    pub periods: BTreeSet<Period>,
    pub earliest_from: Period,
    pub latest_to: Period,
    pub filters_fingerprint: Fingerprint,
    pub filters: DimensionFilters,
    pub book: BookId,
}

impl GridDescriptor {
    /// Opening values are balances as of the close of this period.
    pub fn anchor(&self) -> Period {
        self.earliest_from.pred()
    }

    pub fn batch_fingerprint(&self) -> Fingerprint {
        batch_fingerprint(
            &self.entities,
            self.anchor(),
            self.earliest_from,
            self.latest_to,
            &self.filters_fingerprint,
        )
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn period_count(&self) -> usize {
        self.periods.len()
    }

    /// Number of months the period-deltas call spans.
    pub fn delta_span(&self) -> usize {
        (self.earliest_from.months_until(self.latest_to) + 1).max(0) as usize
    }

    /// Whether this grid's running balances determine `query`'s value.
    pub fn covers(&self, query: &BalanceQuery) -> bool {
        if query.book() != self.book
            || query.filters() != &self.filters
            || !self.entities.contains(query.entity())
        {
            return false;
        }
        let to = query.to_period();
        if to > self.latest_to {
            return false;
        }
        match query.from_period() {
            // balance(to) − balance(pred(from)) needs pred(from) ≥ anchor
            Some(from) => from >= self.earliest_from,
            None => to >= self.anchor(),
        }
    }
}

/// A detected grid and the period-activity requests that formed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCandidate {
    pub descriptor: GridDescriptor,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridDetection {
    /// One per qualifying filters group, in filters-fingerprint order.
    pub grids: Vec<GridCandidate>,
    /// Period-activity requests whose group did not qualify.
    pub loose: Vec<usize>,
}

/// Find grids among the period-activity requests of `requests`.
pub fn detect_grids(requests: &[PendingRequest]) -> GridDetection {
    let part = partition(requests);
    detect_in(requests, &part.period_activity)
}

pub(crate) fn detect_in(requests: &[PendingRequest], indexes: &[usize]) -> GridDetection {
    let mut groups: BTreeMap<Fingerprint, Vec<usize>> = BTreeMap::new();
    for &idx in indexes {
        let q = &requests[idx].query;
        groups
            .entry(filters_fingerprint(q.filters(), q.book()))
            .or_default()
            .push(idx);
    }

    let mut out = GridDetection::default();
    for (filters_fp, members) in groups {
        match describe(requests, &members, filters_fp) {
            Some(descriptor) => out.grids.push(GridCandidate {
                descriptor,
                members,
            }),
            None => out.loose.extend(members),
        }
    }
    out
}

fn describe(
    requests: &[PendingRequest],
    members: &[usize],
    filters_fingerprint: Fingerprint,
) -> Option<GridDescriptor> {
    let first = &requests[*members.first()?].query;
    let mut entities = BTreeSet::new();
    let mut periods = BTreeSet::new();
    let mut earliest_from: Option<Period> = None;
    let mut latest_to: Option<Period> = None;

    for &idx in members {
        let q = &requests[idx].query;
        let from = q.from_period()?;
        let to = q.to_period();
        entities.insert(q.entity().clone());
        periods.insert(from);
        periods.insert(to);
        earliest_from = Some(earliest_from.map_or(from, |p| p.min(from)));
        latest_to = Some(latest_to.map_or(to, |p| p.max(to)));
    }

    if entities.len() < 2 || periods.len() < 2 {
        return None;
    }
    Some(GridDescriptor {
        entities,
        periods,
        earliest_from: earliest_from?,
        latest_to: latest_to?,
        filters_fingerprint,
        filters: first.filters().clone(),
        book: first.book(),
    })
}
