//! Confirmed trades.

use crate::decimal::{Money, Price, Volume};
use crate::error::CoreError;
use crate::types::{AccountId, Direction, ExposureKey, Instrument, Timeframe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(CoreError::UnknownVariant {
                kind: "position status",
                value: s.to_string(),
            }),
        }
    }
}

/// A broker-acknowledged trade.
///
/// Positions are only materialized once the gateway confirms execution, so
/// the broker id is always known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub broker_id: String,
    pub account: AccountId,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub volume: Volume,
    pub open_price: Price,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub status: PositionStatus,
    pub signal_id: Option<String>,
    pub opened_at_ms: u64,
    pub closed_at_ms: Option<u64>,
    pub close_reason: Option<String>,
    /// Realized P&L reported on close.
    pub realized_pnl: Option<Money>,
    /// Set once the realized P&L has been fed into the daily drawdown.
    pub pnl_settled: bool,
}

impl Position {
    pub fn exposure_key(&self) -> ExposureKey {
        ExposureKey::new(self.account.clone(), self.instrument.clone(), self.timeframe)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}
