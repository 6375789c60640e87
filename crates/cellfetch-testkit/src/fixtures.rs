//! Request fixtures.

use cellfetch_common::{BalanceQuery, DimensionFilters, Period};

/// Panics on an invalid month; fixtures only.
pub fn period(year: i32, month: u32) -> Period {
    Period::new(year, month).expect("fixture period")
}

pub fn cumulative(entity: &str, to: Period) -> BalanceQuery {
    BalanceQuery::cumulative(entity, to).expect("fixture query")
}

pub fn activity(entity: &str, from: Period, to: Period) -> BalanceQuery {
    BalanceQuery::activity(entity, from, to).expect("fixture query")
}

/// Year-to-date style request: fixed `from`, one column per `to`.
pub fn ytd_grid(entities: &[&str], from: Period, tos: &[Period]) -> Vec<BalanceQuery> {
    entities
        .iter()
        .flat_map(|e| tos.iter().map(move |to| activity(e, from, *to)))
        .collect()
}

/// `count` entities named `"4000"`, `"4001"`, ...
pub fn entity_names(count: usize) -> Vec<String> {
    (0..count).map(|i| (4000 + i).to_string()).collect()
}

pub fn subsidiary(id: &str) -> DimensionFilters {
    DimensionFilters::new().with("subsidiary", id)
}
