//! Per-account circuit-breaker state.

use crate::decimal::Money;
use crate::error::CoreError;
use crate::types::AccountId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakerState {
    Closed,
    Tripped,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("CLOSED"),
            Self::Tripped => f.write_str("TRIPPED"),
        }
    }
}

/// Why the breaker tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    ConsecutiveFailures,
    DailyLoss,
    Manual,
}

impl TripReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsecutiveFailures => "consecutive_failures",
            Self::DailyLoss => "daily_loss",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consecutive_failures" => Ok(Self::ConsecutiveFailures),
            "daily_loss" => Ok(Self::DailyLoss),
            "manual" => Ok(Self::Manual),
            _ => Err(CoreError::UnknownVariant {
                kind: "trip reason",
                value: s.to_string(),
            }),
        }
    }
}

/// Persisted risk state of one account.
///
/// `version` is bumped on every successful write and is used as the
/// compare-and-swap token by concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskState {
    pub account: AccountId,
    pub consecutive_failures: u32,
    /// Realized P&L of the current tracking day.
    pub daily_pnl: Money,
    pub tripped: bool,
    pub tripped_at_ms: Option<u64>,
    /// Earliest time the breaker may auto-reset (None for manual trips).
    pub cooldown_until_ms: Option<u64>,
    pub trip_reason: Option<TripReason>,
    /// UTC calendar day `daily_pnl` belongs to.
    pub tracking_date: NaiveDate,
    pub version: u64,
}

impl RiskState {
    /// Fresh, untripped state for `account` tracking `date`.
    pub fn new(account: AccountId, date: NaiveDate) -> Self {
        Self {
            account,
            consecutive_failures: 0,
            daily_pnl: Money::ZERO,
            tripped: false,
            tripped_at_ms: None,
            cooldown_until_ms: None,
            trip_reason: None,
            tracking_date: date,
            version: 0,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        if self.tripped {
            BreakerState::Tripped
        } else {
            BreakerState::Closed
        }
    }
}
