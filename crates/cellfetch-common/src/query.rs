//! The parameters of one cell value request.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::period::Period;

/// Account identifier as the host supplies it (trimmed, case preserved).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accounting book. Book 1 is the primary book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub u32);

impl Default for BookId {
    fn default() -> Self {
        BookId(1)
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subsidiary / department / location / class style filters.
///
/// Keys are lower-cased and trimmed, values trimmed. An empty value is the same
/// query as an absent filter, so it is dropped on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionFilters(BTreeMap<String, String>);

impl DimensionFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key.is_empty() {
            return;
        }
        if value.is_empty() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for DimensionFilters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut filters = Self::new();
        for (k, v) in iter {
            filters.insert(k.as_ref(), v.as_ref());
        }
        filters
    }
}

/// How a request relates its two period endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestShape {
    /// No `from`: balance as of the close of `to`.
    Cumulative,
    /// `from < to`: net activity over `from..=to`. The only shape that forms grids.
    PeriodActivity,
    /// `from == to`: activity for a single period.
    Ranged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Routing {
    /// Eligible for grid batching.
    #[default]
    Auto,
    /// Always fetched on its own (the bulk endpoints cannot express it).
    IndividualOnly,
}

/// One cell's worth of backend query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceQuery {
    entity: EntityId,
    from: Option<Period>,
    to: Period,
    filters: DimensionFilters,
    book: BookId,
    routing: Routing,
}

impl BalanceQuery {
    /// Balance of `entity` as of the close of `to`.
    pub fn cumulative(entity: impl Into<EntityId>, to: Period) -> Result<Self, FetchError> {
        Self::build(entity.into(), None, to)
    }

    /// Net activity of `entity` over `from..=to`.
    pub fn activity(
        entity: impl Into<EntityId>,
        from: Period,
        to: Period,
    ) -> Result<Self, FetchError> {
        if from > to {
            return Err(FetchError::invalid(format!(
                "from period {from} is after to period {to}"
            )));
        }
        Self::build(entity.into(), Some(from), to)
    }

    /// Build from raw host arguments. An empty `from` means a cumulative request.
    pub fn from_host(entity: &str, from: &str, to: &str) -> Result<Self, FetchError> {
        let to = Period::parse(to)?;
        if from.trim().is_empty() {
            Self::cumulative(entity, to)
        } else {
            Self::activity(entity, Period::parse(from)?, to)
        }
    }

    fn build(entity: EntityId, from: Option<Period>, to: Period) -> Result<Self, FetchError> {
        if entity.is_empty() {
            return Err(FetchError::invalid("entity id is empty"));
        }
        Ok(Self {
            entity,
            from,
            to,
            filters: DimensionFilters::default(),
            book: BookId::default(),
            routing: Routing::Auto,
        })
    }

    pub fn with_filters(mut self, filters: DimensionFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_book(mut self, book: BookId) -> Self {
        self.book = book;
        self
    }

    pub fn individual_only(mut self) -> Self {
        self.routing = Routing::IndividualOnly;
        self
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn from_period(&self) -> Option<Period> {
        self.from
    }

    pub fn to_period(&self) -> Period {
        self.to
    }

    pub fn filters(&self) -> &DimensionFilters {
        &self.filters
    }

    pub fn book(&self) -> BookId {
        self.book
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn shape(&self) -> RequestShape {
        match self.from {
            None => RequestShape::Cumulative,
            Some(from) if from == self.to => RequestShape::Ranged,
            Some(_) => RequestShape::PeriodActivity,
        }
    }
}

impl fmt::Display for BalanceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(f, "{} [{}..={}]", self.entity, from, self.to)?,
            None => write!(f, "{} [..={}]", self.entity, self.to)?,
        }
        if !self.filters.is_empty() {
            write!(f, " {{")?;
            for (i, (k, v)) in self.filters.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
            }
            write!(f, "}}")?;
        }
        write!(f, " book {}", self.book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;

    fn p(y: i32, m: u32) -> Period {
        Period::new(y, m).unwrap()
    }

    #[test]
    fn shapes_follow_endpoints() {
        let q = BalanceQuery::cumulative("1000", p(2025, 1)).unwrap();
        assert_eq!(q.shape(), RequestShape::Cumulative);
        let q = BalanceQuery::activity("1000", p(2025, 1), p(2025, 1)).unwrap();
        assert_eq!(q.shape(), RequestShape::Ranged);
        let q = BalanceQuery::activity("1000", p(2025, 1), p(2025, 3)).unwrap();
        assert_eq!(q.shape(), RequestShape::PeriodActivity);
    }

    #[test]
    fn from_after_to_is_invalid() {
        let err = BalanceQuery::activity("1000", p(2025, 3), p(2025, 1)).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Invalid);
    }

    #[test]
    fn host_arguments_parse_periods() {
        let q = BalanceQuery::from_host(" 4000 ", "", "2025-02").unwrap();
        assert_eq!(q.entity().as_str(), "4000");
        assert_eq!(q.from_period(), None);
        assert_eq!(q.to_period(), p(2025, 2));

        let err = BalanceQuery::from_host("4000", "", "sometime").unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Invalid);
        let err = BalanceQuery::from_host("  ", "", "Jan 2025").unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Invalid);
    }

    #[test]
    fn filters_normalize_keys_and_drop_blanks() {
        let f = DimensionFilters::new()
            .with(" Subsidiary ", " Celigo Inc. ")
            .with("department", "");
        assert_eq!(f.get("SUBSIDIARY"), Some("Celigo Inc."));
        assert_eq!(f.get("department"), None);
        assert_eq!(f, DimensionFilters::new().with("subsidiary", "Celigo Inc."));
    }
}
