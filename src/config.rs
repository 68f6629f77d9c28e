//! Scheduler configuration.
//!
//! This module provides:
//! - The per-context tuning knobs with sensible defaults
//! - Validation for guardrail invariants
//! - `FIBERLOOP_*` environment overrides
//!
//! Note: there is no config file layer; a scheduler instance is configured
//! programmatically by the host that owns the thread.

use std::time::Duration;

/// Tuning knobs for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker-to-worker switches tolerated while the loop fiber is
    /// parked before it is forcibly resumed to give the reactor a polling
    /// opportunity.
    pub main_switch_limit: u32,
    /// Number of drain passes run after the reactor loop exits. Two passes
    /// are needed because `restart()` can re-admit handlers queued during
    /// the first drain.
    pub cleanup_passes: u32,
    /// Upper bound on how long the dispatcher parks when it has no deadline
    /// to honor. Purely a liveness backstop; wake-ups normally arrive
    /// through the reactor.
    pub idle_park_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            main_switch_limit: 4,
            cleanup_passes: 2,
            idle_park_cap: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Creates the default configuration with environment overrides applied.
    ///
    /// Recognized variables: `FIBERLOOP_MAIN_SWITCH_LIMIT`,
    /// `FIBERLOOP_CLEANUP_PASSES`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_switch_limit == 0 {
            return Err(ConfigError::InvalidSwitchLimit);
        }
        if self.cleanup_passes == 0 {
            return Err(ConfigError::InvalidCleanupPasses);
        }
        if self.idle_park_cap < Duration::from_millis(1) {
            return Err(ConfigError::IdleParkCapTooShort);
        }
        Ok(())
    }
}

/// Configuration validation or override error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `main_switch_limit` must be at least 1.
    InvalidSwitchLimit,
    /// `cleanup_passes` must be at least 1.
    InvalidCleanupPasses,
    /// `idle_park_cap` is below the minimum resolution.
    IdleParkCapTooShort,
    /// An environment override could not be parsed.
    InvalidEnvOverride {
        /// The offending variable name.
        key: String,
        /// The value that failed to parse.
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSwitchLimit => write!(f, "main_switch_limit must be at least 1"),
            Self::InvalidCleanupPasses => write!(f, "cleanup_passes must be at least 1"),
            Self::IdleParkCapTooShort => write!(f, "idle_park_cap must be at least 1ms"),
            Self::InvalidEnvOverride { key, value } => {
                write!(f, "invalid environment override {key}={value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn apply_env_overrides(config: &mut SchedulerConfig) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var("FIBERLOOP_MAIN_SWITCH_LIMIT") {
        config.main_switch_limit = parse_override("FIBERLOOP_MAIN_SWITCH_LIMIT", &value)?;
    }
    if let Ok(value) = std::env::var("FIBERLOOP_CLEANUP_PASSES") {
        config.cleanup_passes = parse_override("FIBERLOOP_CLEANUP_PASSES", &value)?;
    }
    Ok(())
}

fn parse_override(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}
