//! Durable, cross-context key-value store seam.
//!
//! Implementations are shared between independent execution contexts (a formula
//! context and a task-pane context, say). Writes are last-write-wins; callers never
//! assume a read-modify-write is atomic across contexts.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("durable store rejected write for '{key}': {reason}")]
    WriteRejected { key: String, reason: String },
    #[error("corrupt entry under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`. `ttl = None` keeps the entry until overwritten or removed.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}
