mod compaction;
mod linking;
mod observability;
mod sequence;

pub use compaction::*;
pub use linking::*;
pub use observability::*;
pub use sequence::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub linking: LinkingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;

        let issues = config.validate();
        for issue in &issues {
            tracing::warn!(issue = %issue, "config issue");
        }
        if let Some(err) = issues
            .iter()
            .find(|i| i.severity == ConfigSeverity::Error)
        {
            return Err(Error::Config(err.to_string()));
        }
        Ok(config)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.sequence.max_attempts == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sequence.max_attempts".into(),
                message: "at least one insert attempt is required".into(),
            });
        }

        if self.sequence.backoff_step_ms > 1_000 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "sequence.backoff_step_ms".into(),
                message: "backoff above 1s per attempt stalls writers under contention".into(),
            });
        }

        if self.compaction.preview_chars == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "compaction.preview_chars".into(),
                message: "summary previews must keep at least one character".into(),
            });
        }

        if self.linking.link_mode.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "linking.link_mode".into(),
                message: "empty link mode makes link messages indistinguishable".into(),
            });
        }

        errors
    }
}
