//! Economy tuning parameters, loadable from YAML.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::SearchKind;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Longest configurable period: one hundred years.
const MAX_MINUTES: i64 = 100 * 365 * 24 * 60;

/// Economy configuration. Missing fields fall back to [`Default`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EconomyConfig {
    /// Delay before the single retry of a failed settlement.
    pub retry_delay_ms: u64,
    /// Upper bound on a single settlement's execution.
    pub settlement_timeout_ms: u64,
    /// Minutes between two interest payments.
    pub interest_period_minutes: i64,
    /// Missed payments that trigger a forced principal payment.
    pub max_delayed_payments: u32,
    /// Liquidation value of one terrain in USD.
    pub terrain_price: Decimal,
    /// Interest rate applied per period to new loans.
    pub loan_interest_rate: Decimal,
    /// Largest principal a single loan may have.
    pub max_loan: Decimal,
    pub graduate_search_minutes: i64,
    pub graduate_search_cost: Decimal,
    pub experienced_search_minutes: i64,
    pub experienced_search_cost: Decimal,
    /// Minutes before an unanswered offer turns into a hire.
    pub offer_expiry_minutes: i64,
    /// Seed for candidate generation.
    pub rng_seed: u64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1_000,
            settlement_timeout_ms: 3_000,
            interest_period_minutes: 24 * 60,
            max_delayed_payments: 4,
            terrain_price: Decimal::new(100_000, 0),
            loan_interest_rate: Decimal::new(5, 2),
            max_loan: Decimal::new(1_000_000, 0),
            graduate_search_minutes: 60,
            graduate_search_cost: Decimal::new(1_000, 0),
            experienced_search_minutes: 180,
            experienced_search_cost: Decimal::new(5_000, 0),
            offer_expiry_minutes: 24 * 60,
            rng_seed: 42,
        }
    }
}

impl EconomyConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: EconomyConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_minutes = [
            ("interest_period_minutes", self.interest_period_minutes),
            ("graduate_search_minutes", self.graduate_search_minutes),
            ("experienced_search_minutes", self.experienced_search_minutes),
            ("offer_expiry_minutes", self.offer_expiry_minutes),
        ];
        for (field, minutes) in positive_minutes {
            if minutes <= 0 || minutes > MAX_MINUTES {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{minutes} is not within 1..={MAX_MINUTES} minutes"),
                });
            }
        }
        if self.max_delayed_payments == 0 {
            return Err(ConfigError::Invalid {
                field: "max_delayed_payments",
                reason: "must be at least 1".to_string(),
            });
        }
        if crate::validate_rate(self.loan_interest_rate).is_err() {
            return Err(ConfigError::Invalid {
                field: "loan_interest_rate",
                reason: format!("{} is outside [0,1]", self.loan_interest_rate),
            });
        }
        let money = [
            ("terrain_price", self.terrain_price),
            ("max_loan", self.max_loan),
            ("graduate_search_cost", self.graduate_search_cost),
            ("experienced_search_cost", self.experienced_search_cost),
        ];
        for (field, amount) in money {
            if amount < Decimal::ZERO {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{amount} is negative"),
                });
            }
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settlement_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settlement_timeout_ms)
    }

    pub fn interest_period(&self) -> Duration {
        Duration::minutes(self.interest_period_minutes)
    }

    pub fn offer_expiry(&self) -> Duration {
        Duration::minutes(self.offer_expiry_minutes)
    }

    /// Duration and price of a staff search.
    pub fn search(&self, kind: SearchKind) -> (Duration, Decimal) {
        match kind {
            SearchKind::Graduate => (
                Duration::minutes(self.graduate_search_minutes),
                self.graduate_search_cost,
            ),
            SearchKind::Experienced => (
                Duration::minutes(self.experienced_search_minutes),
                self.experienced_search_cost,
            ),
        }
    }
}
