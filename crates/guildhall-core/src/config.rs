//! Engine configuration.
//!
//! Values come from `GUILDHALL_*` environment variables, falling back to the
//! defaults below. The struct also deserializes for hosts that embed the
//! engine and keep configuration elsewhere.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed.
    #[error("invalid value for {key}: `{value}`")]
    InvalidValue {
        /// The environment variable name.
        key: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The combination of values is inconsistent.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// What to do when a consequence instruction fails in a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Log and move on to the next instruction.
    Drop,
    /// Re-attempt up to `max_attempts` times in total.
    Retry {
        /// Total attempts including the first one.
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Total number of attempts allowed for a single instruction.
    #[must_use]
    pub fn attempts(self) -> u32 {
        match self {
            Self::Drop => 1,
            Self::Retry { max_attempts } => max_attempts.max(1),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Inclusive bounds for relationship strength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrengthBounds {
    /// Lowest allowed strength.
    pub min: f64,
    /// Highest allowed strength.
    pub max: f64,
}

impl StrengthBounds {
    /// Clamps `value` into the bounds.
    #[must_use]
    pub fn clamp(self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

impl Default for StrengthBounds {
    fn default() -> Self {
        Self {
            min: -100.0,
            max: 100.0,
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Relationship strength bounds.
    pub strength_bounds: StrengthBounds,
    /// Retry policy for failed consequence instructions.
    pub consequence_retry: RetryPolicy,
    /// How many nested quest-state consequences may cascade.
    pub max_cascade_depth: u32,
    /// Seconds between background flushes.
    pub flush_interval_secs: u64,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strength_bounds: StrengthBounds::default(),
            consequence_retry: RetryPolicy::Drop,
            max_cascade_depth: 4,
            flush_interval_secs: 30,
            log_format: LogFormat::Json,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw })
}

impl EngineConfig {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is
    /// inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to
    /// its value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is
    /// inconsistent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("GUILDHALL_STRENGTH_MIN") {
            config.strength_bounds.min = parse("GUILDHALL_STRENGTH_MIN", raw)?;
        }
        if let Some(raw) = lookup("GUILDHALL_STRENGTH_MAX") {
            config.strength_bounds.max = parse("GUILDHALL_STRENGTH_MAX", raw)?;
        }
        if let Some(raw) = lookup("GUILDHALL_CONSEQUENCE_RETRY") {
            config.consequence_retry = match raw.trim() {
                "drop" => RetryPolicy::Drop,
                "retry" => {
                    let max_attempts = match lookup("GUILDHALL_CONSEQUENCE_MAX_ATTEMPTS") {
                        Some(raw) => parse("GUILDHALL_CONSEQUENCE_MAX_ATTEMPTS", raw)?,
                        None => 3,
                    };
                    RetryPolicy::Retry { max_attempts }
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "GUILDHALL_CONSEQUENCE_RETRY",
                        value: raw,
                    });
                }
            };
        }
        if let Some(raw) = lookup("GUILDHALL_MAX_CASCADE_DEPTH") {
            config.max_cascade_depth = parse("GUILDHALL_MAX_CASCADE_DEPTH", raw)?;
        }
        if let Some(raw) = lookup("GUILDHALL_FLUSH_INTERVAL_SECS") {
            config.flush_interval_secs = parse("GUILDHALL_FLUSH_INTERVAL_SECS", raw)?;
        }
        if let Some(raw) = lookup("GUILDHALL_LOG_FORMAT") {
            config.log_format = match raw.trim() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "GUILDHALL_LOG_FORMAT",
                        value: raw,
                    });
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` when the strength bounds are empty or
    /// not finite, or the flush interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let StrengthBounds { min, max } = self.strength_bounds;
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(ConfigError::Validation(format!(
                "strength bounds must satisfy min < max, got [{min}, {max}]"
            )));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "flush interval must be at least one second".to_owned(),
            ));
        }
        Ok(())
    }

    /// The background flush cadence.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.strength_bounds.min, -100.0);
        assert_eq!(config.strength_bounds.max, 100.0);
        assert_eq!(config.consequence_retry, RetryPolicy::Drop);
    }

    #[test]
    fn test_retry_policy_reads_max_attempts() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("GUILDHALL_CONSEQUENCE_RETRY", "retry"),
            ("GUILDHALL_CONSEQUENCE_MAX_ATTEMPTS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.consequence_retry, RetryPolicy::Retry { max_attempts: 5 });
        assert_eq!(config.consequence_retry.attempts(), 5);
    }

    #[test]
    fn test_inverted_bounds_are_rejected() {
        let result = EngineConfig::from_lookup(lookup(&[
            ("GUILDHALL_STRENGTH_MIN", "10"),
            ("GUILDHALL_STRENGTH_MAX", "5"),
        ]));

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let result = EngineConfig::from_lookup(lookup(&[("GUILDHALL_MAX_CASCADE_DEPTH", "deep")]));

        assert_eq!(
            result.unwrap_err(),
            ConfigError::InvalidValue {
                key: "GUILDHALL_MAX_CASCADE_DEPTH",
                value: "deep".to_owned(),
            }
        );
    }

    #[test]
    fn test_clamp_respects_bounds() {
        let bounds = StrengthBounds::default();
        assert_eq!(bounds.clamp(250.0), 100.0);
        assert_eq!(bounds.clamp(-250.0), -100.0);
        assert_eq!(bounds.clamp(12.5), 12.5);
    }
}
