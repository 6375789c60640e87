//! Cell-level error representation.
//!
//! - **`FetchErrorKind`**: the canonical set of error codes a cell can show
//! - **`FetchError`**    : kind + optional human explanation
//!
//! `Display` renders the code exactly as the host shows it in place of a value
//! (`#TIMEOUT!`, `#RATELIMIT!`, …). A limit-exceeded grid is *not* an error and has
//! no code here: it is a planning decision that falls back to individual fetches.

use std::{error::Error, fmt};

use crate::period::PeriodError;
use crate::store::StoreError;

/// All error codes a resolved cell may carry.
///
/// **Note:** names are CamelCase (idiomatic Rust) while `Display`
/// renders them the way the host prints them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// The backend did not answer in time.
    Timeout,
    /// The backend refused the call because of concurrency or rate limits.
    RateLimited,
    /// The backend answered with a server-side failure.
    Server,
    /// The backend answered, but the payload could not be interpreted.
    Shape,
    /// The request itself is malformed (bad period, from after to, empty entity).
    Invalid,
    /// The durable store failed on an explicit store operation.
    Store,
    /// The engine dropped the request before it could be resolved.
    Cancelled,
    /// A fetch task panicked.
    Internal,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "#TIMEOUT!",
            Self::RateLimited => "#RATELIMIT!",
            Self::Server => "#BACKEND!",
            Self::Shape => "#SHAPE!",
            Self::Invalid => "#INVALID!",
            Self::Store => "#STORE!",
            Self::Cancelled => "#CANCELLED!",
            Self::Internal => "#INTERNAL!",
        })
    }
}

impl FetchErrorKind {
    /// Inverse of `Display`; `None` for unknown codes.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "#TIMEOUT!" => Some(Self::Timeout),
            "#RATELIMIT!" => Some(Self::RateLimited),
            "#BACKEND!" => Some(Self::Server),
            "#SHAPE!" => Some(Self::Shape),
            "#INVALID!" => Some(Self::Invalid),
            "#STORE!" => Some(Self::Store),
            "#CANCELLED!" => Some(Self::Cancelled),
            "#INTERNAL!" => Some(Self::Internal),
            _ => None,
        }
    }

    /// Backend conditions that may succeed if the host asks again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Server)
    }
}

/// The error value every waiting caller receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: Option<String>,
}

/* ───────────────────── Constructors & helpers ─────────────────────── */

impl From<FetchErrorKind> for FetchError {
    fn from(kind: FetchErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }
}

impl FetchError {
    pub fn new(kind: FetchErrorKind) -> Self {
        kind.into()
    }

    /// Attach a human-readable explanation.
    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Timeout).with_message(msg)
    }

    pub fn rate_limited<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::RateLimited).with_message(msg)
    }

    pub fn server<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Server).with_message(msg)
    }

    pub fn shape<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Shape).with_message(msg)
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Invalid).with_message(msg)
    }

    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Cancelled).with_message(msg)
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::new(FetchErrorKind::Internal).with_message(msg)
    }
}

/* ───────────────────────── Display / Error ────────────────────────── */

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl Error for FetchError {}

impl From<FetchError> for String {
    fn from(error: FetchError) -> Self {
        format!("{error}")
    }
}

impl From<PeriodError> for FetchError {
    fn from(error: PeriodError) -> Self {
        FetchError::invalid(error.to_string())
    }
}

impl From<StoreError> for FetchError {
    fn from(error: StoreError) -> Self {
        FetchError::new(FetchErrorKind::Store).with_message(error.to_string())
    }
}

impl PartialEq<str> for FetchErrorKind {
    fn eq(&self, other: &str) -> bool {
        format!("{self}") == other
    }
}

impl PartialEq<&str> for FetchError {
    fn eq(&self, other: &&str) -> bool {
        self.kind.to_string() == *other
    }
}
