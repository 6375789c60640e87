use std::fmt;

use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::query::{BalanceQuery, BookId, DimensionFilters, EntityId};

/// Canonical cache / dedup key.
///
/// Only ever produced by this module, so every read and write path agrees on the
/// period and filter normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extension trait for query-like values to generate deterministic fingerprints
pub trait QueryFingerprint {
    /// Generate a stable, deterministic fingerprint. Used as the cache key and as
    /// the ledger key for deduplicating callers.
    fn fingerprint(&self) -> Fingerprint;
}

impl QueryFingerprint for BalanceQuery {
    fn fingerprint(&self) -> Fingerprint {
        // Routing is deliberately absent: it changes the path, not the value.
        Fingerprint(format!(
            "bal:{}:{}:{}:{}",
            escape(self.entity().as_str()),
            self.from_period()
                .map_or_else(|| "_".to_string(), |p| p.to_string()),
            self.to_period(),
            filters_key(self.filters(), self.book())
        ))
    }
}

/// Key shared by every request that may sit in the same grid.
pub fn filters_fingerprint(filters: &DimensionFilters, book: BookId) -> Fingerprint {
    Fingerprint(filters_key(filters, book))
}

/// Key of one bulk fetch: sorted entities, anchor and delta range, filters.
pub fn batch_fingerprint<'a, I>(
    entities: I,
    anchor: Period,
    earliest_from: Period,
    latest_to: Period,
    filters: &Fingerprint,
) -> Fingerprint
where
    I: IntoIterator<Item = &'a EntityId>,
{
    let mut sorted: Vec<&EntityId> = entities.into_iter().collect();
    sorted.sort();
    sorted.dedup();
    let joined = sorted
        .iter()
        .map(|e| escape(e.as_str()))
        .collect::<Vec<_>>()
        .join(",");
    Fingerprint(format!(
        "grid:[{joined}]:{anchor}:{earliest_from}:{latest_to}:{filters}"
    ))
}

fn filters_key(filters: &DimensionFilters, book: BookId) -> String {
    let body = filters
        .iter()
        .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
        .collect::<Vec<_>>()
        .join(";");
    format!("f[{body}]b{book}")
}

/// Percent-escape the separators used above so distinct inputs never collide.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            ';' => out.push_str("%3B"),
            '=' => out.push_str("%3D"),
            ',' => out.push_str("%2C"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            _ => out.push(ch),
        }
    }
    out
}
