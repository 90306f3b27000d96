//! Engine configuration.
//!
//! Loaded from a TOML file. Every field has a default so an empty file (or no
//! file at all) yields the production policy.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

const STRICT_WAIT_LIMIT_DAYS: u32 = 30;
const MAX_STUCK_PAYOUT_HOURS: i64 = 24 * 365;
const MAX_REMINDER_OFFSET_DAYS: i64 = 365;

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Payout initiation attempts before the cycle is marked `payout_failed`.
    pub max_payout_attempts: u32,
    /// Upper bound on the grace window of `strict_wait` circles, 1 to 30 days.
    pub strict_wait_max_days: u32,
    /// Largest share of a reserve balance a single coverage may consume.
    pub reserve_cap_ratio: Decimal,
    /// A pending payout older than this raises a stuck-payout alert.
    pub stuck_payout_hours: i64,
    /// Reminder offsets, in days before the contribution deadline.
    pub reminder_offsets_days: Vec<i64>,
    /// Expected cadence of the external scheduler.
    pub run_interval_minutes: i64,
    /// Number of missed intervals tolerated before the health check alerts.
    pub missed_run_tolerance: i64,
    /// Late fee assessed on contributions completed after the deadline,
    /// as a percentage of the expected amount.
    pub late_fee_percent: Decimal,
    pub score: ScorePoints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payout_attempts: 3,
            strict_wait_max_days: 30,
            reserve_cap_ratio: dec!(0.20),
            stuck_payout_hours: 72,
            reminder_offsets_days: vec![7, 3, 1, 0],
            run_interval_minutes: 15,
            missed_run_tolerance: 2,
            late_fee_percent: Decimal::ZERO,
            score: ScorePoints::default(),
        }
    }
}

/// Trust-score deltas applied by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorePoints {
    pub late_contribution: i32,
    pub member_default: i32,
    pub voucher_penalty: i32,
    pub on_time_contribution: i32,
    pub circle_completion_bonus: i32,
}

impl Default for ScorePoints {
    fn default() -> Self {
        Self {
            late_contribution: -5,
            member_default: -30,
            voucher_penalty: -10,
            on_time_contribution: 2,
            circle_completion_bonus: 10,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payout_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_payout_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=STRICT_WAIT_LIMIT_DAYS).contains(&self.strict_wait_max_days) {
            return Err(ConfigError::Validation(format!(
                "strict_wait_max_days must be between 1 and {STRICT_WAIT_LIMIT_DAYS}"
            )));
        }
        if self.reserve_cap_ratio < Decimal::ZERO || self.reserve_cap_ratio > Decimal::ONE {
            return Err(ConfigError::Validation(
                "reserve_cap_ratio must be between 0 and 1".to_string(),
            ));
        }
        if self.late_fee_percent < Decimal::ZERO {
            return Err(ConfigError::Validation(
                "late_fee_percent cannot be negative".to_string(),
            ));
        }
        if self.stuck_payout_hours > MAX_STUCK_PAYOUT_HOURS {
            return Err(ConfigError::Validation(format!(
                "stuck_payout_hours cannot exceed {MAX_STUCK_PAYOUT_HOURS}"
            )));
        }
        if self.stuck_payout_hours <= 0 || self.run_interval_minutes <= 0 {
            return Err(ConfigError::Validation(
                "stuck_payout_hours and run_interval_minutes must be positive".to_string(),
            ));
        }
        if self
            .reminder_offsets_days
            .iter()
            .any(|d| !(0..=MAX_REMINDER_OFFSET_DAYS).contains(d))
        {
            return Err(ConfigError::Validation(format!(
                "reminder offsets are days before the deadline, from 0 to {MAX_REMINDER_OFFSET_DAYS}"
            )));
        }
        Ok(())
    }
}
