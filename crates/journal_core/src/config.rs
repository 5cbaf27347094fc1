//! Runtime configuration for the journal core.
//!
//! # Responsibility
//! - Describe retry/backoff, edit handling and logging knobs in one place.
//! - Load them from JSON with per-field defaults and validate the result.
//!
//! # Invariants
//! - `CoreConfig::default()` always passes `validate()`.
//! - Missing JSON fields fall back to defaults; unknown fields are rejected.

use crate::logging::default_log_level;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Configuration validation/loading error.
#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid { field: &'static str, reason: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::Invalid { field, reason } => write!(f, "invalid config `{field}`: {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub sync: SyncPolicy,
    pub edit: EditPolicy,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        self.edit.validate()
    }
}

/// Retry cap and backoff curve for the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncPolicy {
    /// Failed submissions allowed before a record becomes `failed`.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
    /// Upper bound of random jitter as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            multiplier: 2,
            max_delay_ms: 30_000,
            jitter_ratio: 0.25,
        }
    }
}

impl SyncPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(invalid("sync.max_retries", "must be at least 1"));
        }
        if self.multiplier == 0 {
            return Err(invalid("sync.multiplier", "must be at least 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid(
                "sync.max_delay_ms",
                format!(
                    "{} is below base_delay_ms {}",
                    self.max_delay_ms, self.base_delay_ms
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(invalid("sync.jitter_ratio", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Thresholds for the edit workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditPolicy {
    /// Edits changing fewer words than this skip re-extraction.
    pub min_changed_words: usize,
    /// Version-increment attempts before a conflict is surfaced to the caller.
    pub max_conflict_retries: u32,
}

impl Default for EditPolicy {
    fn default() -> Self {
        Self {
            min_changed_words: 3,
            max_conflict_retries: 3,
        }
    }
}

impl EditPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conflict_retries == 0 {
            return Err(invalid("edit.max_conflict_retries", "must be at least 1"));
        }
        Ok(())
    }
}

/// File logging settings passed to `init_logging`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute directory for rolling log files.
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            log_dir: std::env::temp_dir()
                .join("journal_core")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, CoreConfig, SyncPolicy};

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.base_delay_ms, 2_000);
        assert_eq!(config.sync.max_delay_ms, 30_000);
        assert_eq!(config.edit.min_changed_words, 3);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = CoreConfig::from_json_str(r#"{"sync": {"max_retries": 5}}"#)
            .expect("partial config should parse");
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.multiplier, 2);
        assert_eq!(config.edit.max_conflict_retries, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = CoreConfig::from_json_str(r#"{"sync": {"retries": 5}}"#)
            .expect_err("unknown field should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let policy = SyncPolicy {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..SyncPolicy::default()
        };
        let err = policy.validate().expect_err("inverted bounds should fail");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "sync.max_delay_ms",
                ..
            }
        ));
    }
}
