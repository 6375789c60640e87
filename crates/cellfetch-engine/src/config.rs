//! Engine configuration.
//!
//! Every tunable lives here rather than in constants so operators can raise the
//! grid ceilings after capacity testing. All sections deserialize with defaults,
//! so a partial JSON document only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid engine config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid engine config: {0}")]
    Invalid(String),
}

/// Ceilings above which a detected grid is not batched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_entities: usize,
    pub max_periods: usize,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_entities: 200,
            max_periods: 36,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of process-local entries. `None` keeps them until restart.
    pub local_ttl_ms: Option<u64>,
    /// Lifetime of durable (cross-context) entries.
    pub durable_ttl_ms: u64,
    /// Maximum number of process-local entries.
    pub local_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_ms: None,
            durable_ttl_ms: 5 * 60 * 1000,
            local_capacity: 50_000,
        }
    }
}

impl CacheConfig {
    pub fn local_ttl(&self) -> Option<Duration> {
        self.local_ttl_ms.map(Duration::from_millis)
    }

    pub fn durable_ttl(&self) -> Duration {
        Duration::from_millis(self.durable_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Emit triggers for new periods and let individual-path callers wait on them.
    pub enabled: bool,
    /// Ceiling on one wait for a running preload.
    pub wait_timeout_ms: u64,
    /// How often a waiter re-reads the durable state (completion in another context).
    pub recheck_interval_ms: u64,
    /// A running state older than this is treated as idle.
    pub stale_after_ms: u64,
    /// After a fruitless wait, issue a trigger scoped to the caller's own period
    /// and wait once more before fetching individually.
    pub scoped_retrigger: bool,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_timeout_ms: 90_000,
            recheck_interval_ms: 1_000,
            stale_after_ms: 5 * 60 * 1000,
            scoped_retrigger: true,
        }
    }
}

impl PreloadConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Configuration for the coalescing engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: SafetyLimits,
    pub cache: CacheConfig,
    pub preload: PreloadConfig,
    /// How long `Coalescer::request` lets requests accumulate before a tick.
    pub coalesce_window_ms: u64,
    /// Master switch for grid detection. Off means every request goes individually.
    pub batching_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            cache: CacheConfig::default(),
            preload: PreloadConfig::default(),
            coalesce_window_ms: 50,
            batching_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Defaults plus preload coordination, for hosts that run a warm-up worker in
    /// another context.
    pub fn interactive() -> Self {
        Self {
            preload: PreloadConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_entities < 2 || self.limits.max_periods < 2 {
            return Err(ConfigError::Invalid(
                "grid ceilings below 2 make batching impossible; set batching_enabled = false instead"
                    .to_string(),
            ));
        }
        if self.cache.local_capacity == 0 {
            return Err(ConfigError::Invalid("cache.local_capacity must be > 0".into()));
        }
        if self.preload.enabled && self.preload.wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "preload.wait_timeout_ms must be > 0 when preload is enabled".into(),
            ));
        }
        if self.preload.recheck_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "preload.recheck_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json(r#"{ "limits": { "max_entities": 500 } }"#).unwrap();
        assert_eq!(cfg.limits.max_entities, 500);
        assert_eq!(cfg.limits.max_periods, 36);
        assert_eq!(cfg.cache.durable_ttl(), Duration::from_secs(300));
        assert!(!cfg.preload.enabled);
    }

    #[test]
    fn interactive_enables_preload() {
        let cfg = EngineConfig::interactive();
        assert!(cfg.preload.enabled);
        assert_eq!(cfg.preload.wait_timeout(), Duration::from_secs(90));
        assert_eq!(cfg.limits, SafetyLimits::default());
    }

    #[test]
    fn rejects_degenerate_ceilings() {
        let err = EngineConfig::from_json(r#"{ "limits": { "max_periods": 1 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(matches!(
            EngineConfig::from_json("{ not json").unwrap_err(),
            ConfigError::Json(_)
        ));
    }
}
