//! Remote accounting backend seam.
//!
//! Three call shapes: two bulk calls used by grid batches and the preload worker,
//! plus the single-value call behind the individual fallback. Implementations must
//! report failures with a distinguishable [`FetchErrorKind`](crate::FetchErrorKind)
//! (timeout, rate limit, server error) and must report a zero balance explicitly:
//! an entity or period missing from a bulk response is a shape error, never zero.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::period::Period;
use crate::query::{BalanceQuery, BookId, DimensionFilters, EntityId};

/// entity → value
pub type EntityValues = BTreeMap<EntityId, f64>;

/// entity → period → value
pub type EntityPeriodValues = BTreeMap<EntityId, BTreeMap<Period, f64>>;

/// Balances of `entities` as of the close of `anchor`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpeningValuesRequest {
    pub entities: Vec<EntityId>,
    pub anchor: Period,
    pub filters: DimensionFilters,
    pub book: BookId,
}

/// Per-period activity of `entities` for every period in `from..=to`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodDeltasRequest {
    pub entities: Vec<EntityId>,
    pub from: Period,
    pub to: Period,
    pub filters: DimensionFilters,
    pub book: BookId,
}

#[async_trait]
pub trait AccountingBackend: Send + Sync {
    async fn opening_values(&self, request: &OpeningValuesRequest)
    -> Result<EntityValues, FetchError>;

    async fn period_deltas(
        &self,
        request: &PeriodDeltasRequest,
    ) -> Result<EntityPeriodValues, FetchError>;

    /// One cell, one call. The slow path.
    async fn single_value(&self, query: &BalanceQuery) -> Result<f64, FetchError>;
}
