//! Accounting periods (calendar months) and their canonical `"Mon YYYY"` form.
//!
//! Every path that turns host text into a cache key goes through [`Period::parse`],
//! so `"2025-01"`, `"January 2025"` and `"jan-25"` all land on the same period.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MONTH_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const MONTH_FULL: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 9999;

static NAMED_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]+)[\s\-_/.,]+'?(\d{2}|\d{4})$").unwrap());
static ISO_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-(\d{1,2})$").unwrap());
static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})(?:[T ].*)?$").unwrap());
static SLASH_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})/(\d{4})$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodError {
    #[error("period text is empty")]
    Empty,
    #[error("unrecognised period '{0}'")]
    Unrecognized(String),
    #[error("month {0} is out of range (1-12)")]
    MonthOutOfRange(u32),
    #[error("year {0} is out of range (1900-9999)")]
    YearOutOfRange(i32),
}

/// One accounting period. Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u8,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodError> {
        if !(1..=12).contains(&month) {
            return Err(PeriodError::MonthOutOfRange(month));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(PeriodError::YearOutOfRange(year));
        }
        Ok(Self {
            year,
            month: month as u8,
        })
    }

    /// The period containing `date`.
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month() as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month as u32
    }

    /// Parse any of the accepted host spellings.
    ///
    /// Accepted: `Jan 2025`, `January 2025`, `jan-2025`, `Jan 25`, `2025-01`,
    /// `2025-01-31`, `1/2025`, `01/2025`.
    pub fn parse(text: &str) -> Result<Self, PeriodError> {
        let s = text.trim();
        if s.is_empty() {
            return Err(PeriodError::Empty);
        }

        if let Some(caps) = NAMED_MONTH.captures(s) {
            let month = month_from_name(&caps[1])
                .ok_or_else(|| PeriodError::Unrecognized(s.to_string()))?;
            let year = expand_year(&caps[2])?;
            return Self::new(year, month);
        }
        if let Some(caps) = ISO_MONTH.captures(s) {
            return Self::new(parse_num(&caps[1], s)?, parse_num(&caps[2], s)? as u32);
        }
        if let Some(caps) = ISO_DATE.captures(s) {
            let year: i32 = parse_num(&caps[1], s)?;
            let month: u32 = parse_num(&caps[2], s)? as u32;
            let day: u32 = parse_num(&caps[3], s)? as u32;
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| PeriodError::Unrecognized(s.to_string()))?;
            return Self::new(date.year(), date.month());
        }
        if let Some(caps) = SLASH_MONTH.captures(s) {
            return Self::new(parse_num(&caps[2], s)?, parse_num(&caps[1], s)? as u32);
        }

        Err(PeriodError::Unrecognized(s.to_string()))
    }

    /// The following month.
    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// The preceding month.
    pub fn pred(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Signed number of months from `self` to `other`.
    pub fn months_until(self, other: Period) -> i64 {
        (other.year as i64 - self.year as i64) * 12 + (other.month as i64 - self.month as i64)
    }

    /// Every period from `from` through `to`, inclusive. Empty when `from > to`.
    pub fn range_inclusive(from: Period, to: Period) -> impl Iterator<Item = Period> {
        let len = from.months_until(to).max(-1) + 1;
        std::iter::successors(Some(from), |p| Some(p.succ())).take(len as usize)
    }
}

fn month_from_name(name: &str) -> Option<u32> {
    if name.len() < 3 {
        return None;
    }
    let lower = name.to_ascii_lowercase();
    MONTH_FULL
        .iter()
        .position(|full| full.starts_with(&lower))
        .map(|idx| idx as u32 + 1)
}

fn expand_year(digits: &str) -> Result<i32, PeriodError> {
    let year: i32 = parse_num(digits, digits)?;
    if digits.len() == 2 {
        Ok(2000 + year)
    } else {
        Ok(year)
    }
}

fn parse_num(digits: &str, original: &str) -> Result<i32, PeriodError> {
    digits
        .parse::<i32>()
        .map_err(|_| PeriodError::Unrecognized(original.to_string()))
}

/// Canonical text for a host-supplied period string.
pub fn normalize_period(text: &str) -> Result<String, PeriodError> {
    Period::parse(text).map(|p| p.to_string())
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:04}", MONTH_ABBR[(self.month - 1) as usize], self.year)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(y: i32, m: u32) -> Period {
        Period::new(y, m).unwrap()
    }

    #[test]
    fn accepted_spellings_normalize_identically() {
        for text in [
            "Jan 2025",
            "January 2025",
            "jan-2025",
            "JAN 25",
            "2025-01",
            "2025-1",
            "2025-01-31",
            "2025-01-15T00:00:00",
            "1/2025",
            "01/2025",
            "  Jan 2025  ",
        ] {
            assert_eq!(normalize_period(text).unwrap(), "Jan 2025", "input {text:?}");
        }
        assert_eq!(normalize_period("Sept 2024").unwrap(), "Sep 2024");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Period::parse("   "), Err(PeriodError::Empty));
        assert!(matches!(
            Period::parse("Q1 2025"),
            Err(PeriodError::Unrecognized(_))
        ));
        assert!(matches!(
            Period::parse("Foo 2025"),
            Err(PeriodError::Unrecognized(_))
        ));
        assert_eq!(Period::parse("2025-13"), Err(PeriodError::MonthOutOfRange(13)));
        assert!(Period::parse("2025-02-30").is_err());
    }

    #[test]
    fn ordering_is_chronological_not_lexical() {
        // "Apr" < "Jan" lexically; chronologically January comes first.
        assert!(p(2025, 1) < p(2025, 4));
        assert!(p(2024, 12) < p(2025, 1));
        let mut v = vec![p(2025, 3), p(2024, 11), p(2025, 1)];
        v.sort();
        assert_eq!(v, vec![p(2024, 11), p(2025, 1), p(2025, 3)]);
    }

    #[test]
    fn succ_pred_wrap_years() {
        assert_eq!(p(2024, 12).succ(), p(2025, 1));
        assert_eq!(p(2025, 1).pred(), p(2024, 12));
        assert_eq!(p(2025, 6).succ().pred(), p(2025, 6));
    }

    #[test]
    fn inclusive_ranges() {
        let r: Vec<_> = Period::range_inclusive(p(2024, 11), p(2025, 2)).collect();
        assert_eq!(r, vec![p(2024, 11), p(2024, 12), p(2025, 1), p(2025, 2)]);
        assert_eq!(Period::range_inclusive(p(2025, 2), p(2025, 2)).count(), 1);
        assert_eq!(Period::range_inclusive(p(2025, 3), p(2025, 2)).count(), 0);
        assert_eq!(p(2024, 11).months_until(p(2025, 2)), 3);
    }

    #[test]
    fn serde_uses_canonical_text() {
        let json = serde_json::to_string(&p(2025, 2)).unwrap();
        assert_eq!(json, "\"Feb 2025\"");
        let back: Period = serde_json::from_str("\"2025-02\"").unwrap();
        assert_eq!(back, p(2025, 2));
    }
}
