//! Engine settings loaded from config.toml
//!
//! This module parses the TOML configuration that tunes the ledger engine:
//! the school's timezone, the policy for a withdrawn student's final month,
//! the worker count for batch runs, the invoice sequencer's retry budget,
//! grade overrides for the tuition group resolver, and the tuition groups
//! used to seed an empty database. Every section is optional.

use crate::errors::{Error, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::{collections::HashMap, path::Path, time::Duration};

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// Ledger run settings
    #[serde(default)]
    pub ledger: LedgerSettings,
    /// Invoice sequencer settings
    #[serde(default)]
    pub sequencer: SequencerSettings,
    /// Grade -> fee codes; authoritative over grade matching for that grade
    #[serde(default)]
    pub grade_overrides: HashMap<String, Vec<String>>,
    /// Tuition groups to seed on first run
    #[serde(default)]
    pub tuition_groups: Vec<TuitionGroupConfig>,
}

/// What the ledger does with a student in the month they withdraw
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawnPolicy {
    /// No record for the withdrawal month
    #[default]
    Exclude,
    /// Bill the whole month
    BillInFull,
    /// Bill the share of the month the student was enrolled
    Prorate,
}

/// Ledger run settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerSettings {
    /// School timezone as a whole-hour offset from UTC
    pub timezone_offset_hours: i32,
    /// Treatment of a withdrawn student's final month
    pub withdrawn_policy: WithdrawnPolicy,
    /// Students processed concurrently by a batch run
    pub workers: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            timezone_offset_hours: 7,
            withdrawn_policy: WithdrawnPolicy::Exclude,
            workers: 4,
        }
    }
}

impl LedgerSettings {
    /// The configured offset as a chrono timezone.
    pub fn timezone(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.timezone_offset_hours * 3600).ok_or_else(|| Error::Config {
            message: format!(
                "timezone_offset_hours out of range: {}",
                self.timezone_offset_hours
            ),
        })
    }
}

/// Invoice sequencer settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SequencerSettings {
    /// Allocation attempts before a sequencing error is returned
    pub max_attempts: u32,
    /// Pause between attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
    /// Longest wait for the in-process allocation lock
    pub lock_timeout_ms: u64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_ms: 25,
            lock_timeout_ms: 2_000,
        }
    }
}

impl SequencerSettings {
    /// Backoff before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Bounded wait for the allocation lock
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Configuration for a single tuition group
#[derive(Debug, Deserialize, Clone)]
pub struct TuitionGroupConfig {
    /// Unique fee code
    pub code: String,
    /// Display name
    pub name: String,
    /// Amount billed per applicable month
    pub default_amount: i64,
    /// Grades the group applies to, empty for all
    #[serde(default)]
    pub grades: Vec<String>,
    /// Classes the group applies to, empty for all
    #[serde(default)]
    pub classes: Vec<String>,
    /// Months the group is charged in, empty for all
    #[serde(default)]
    pub apply_months: Vec<u32>,
    /// Only billed to boarding students
    #[serde(default)]
    pub boarding_only: bool,
}

impl AppConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.ledger.timezone()?;
        if self.ledger.workers == 0 {
            return Err(Error::Config {
                message: "ledger.workers must be at least 1".to_string(),
            });
        }
        if self.sequencer.max_attempts == 0 {
            return Err(Error::Config {
                message: "sequencer.max_attempts must be at least 1".to_string(),
            });
        }
        for group in &self.tuition_groups {
            if group.code.trim().is_empty() {
                return Err(Error::Config {
                    message: "tuition group with empty code".to_string(),
                });
            }
            if group.default_amount < 0 {
                return Err(Error::Config {
                    message: format!("tuition group {} has a negative amount", group.code),
                });
            }
            if let Some(m) = group.apply_months.iter().find(|m| !(1..=12).contains(*m)) {
                return Err(Error::Config {
                    message: format!("tuition group {} has invalid month {m}", group.code),
                });
            }
        }
        Ok(())
    }
}

/// Loads and validates the configuration from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - A setting is out of range
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path_ref = path.as_ref();
    tracing::debug!("Attempting to load configuration from: {:?}", path_ref);
    let contents = std::fs::read_to_string(path_ref).map_err(|e| Error::Config {
        message: format!("Failed to read config file {}: {e}", path_ref.display()),
    })?;

    let config: AppConfig = toml::from_str(&contents).map_err(|e| Error::Config {
        message: format!("Failed to parse {}: {e}", path_ref.display()),
    })?;
    config.validate()?;
    Ok(config)
}

/// Loads the configuration from `CONFIG_PATH`, or ./config.toml.
///
/// A missing default file is not an error: built-in defaults are used.
pub fn load_default_config() -> Result<AppConfig> {
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        return load_config(path);
    }
    let default_path = Path::new("config.toml");
    if default_path.exists() {
        load_config(default_path)
    } else {
        tracing::warn!("config.toml not found, using built-in defaults");
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [ledger]
            timezone_offset_hours = 7
            withdrawn_policy = "prorate"
            workers = 2

            [sequencer]
            max_attempts = 3

            [grade_overrides]
            "12" = ["HP12", "EXAM"]

            [[tuition_groups]]
            code = "HP"
            name = "Tuition"
            default_amount = 500
            grades = ["1", "2"]

            [[tuition_groups]]
            code = "NT"
            name = "Boarding"
            default_amount = 200
            apply_months = [9, 10, 11]
            boarding_only = true
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ledger.withdrawn_policy, WithdrawnPolicy::Prorate);
        assert_eq!(config.ledger.workers, 2);
        assert_eq!(config.sequencer.max_attempts, 3);
        assert_eq!(config.sequencer.retry_backoff_ms, 25);
        assert_eq!(config.grade_overrides["12"], vec!["HP12", "EXAM"]);
        assert_eq!(config.tuition_groups.len(), 2);
        assert!(config.tuition_groups[1].boarding_only);
        assert!(config.tuition_groups[0].apply_months.is_empty());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.ledger.timezone_offset_hours, 7);
        assert_eq!(config.ledger.withdrawn_policy, WithdrawnPolicy::Exclude);
        assert_eq!(
            config.ledger.timezone().unwrap(),
            FixedOffset::east_opt(7 * 3600).unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_bad_month() {
        let toml_str = r#"
            [[tuition_groups]]
            code = "BT"
            name = "Meals"
            default_amount = 100
            apply_months = [13]
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config: AppConfig = toml::from_str("[ledger]\nworkers = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
