//! Externally produced trade candidates.

use crate::decimal::Price;
use crate::error::CoreError;
use crate::types::{Direction, Instrument, Timeframe};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a signal as seen by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    #[default]
    Active,
    Expired,
    Executed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Executed => "executed",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "executed" => Ok(Self::Executed),
            _ => Err(CoreError::UnknownVariant {
                kind: "signal status",
                value: s.to_string(),
            }),
        }
    }
}

/// A trade candidate.
///
/// Content is immutable from the controller's point of view. The only field
/// the controller ever advances is `status` (to `Executed`, once a command
/// born from this signal is confirmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub direction: Direction,
    /// Confidence score in `[0, 100]`.
    pub confidence: Decimal,
    pub entry_price: Price,
    /// Absent or zero means the producer did not supply a stop-loss.
    #[serde(default)]
    pub stop_loss: Option<Price>,
    #[serde(default)]
    pub take_profit: Option<Price>,
    /// Creation time (Unix ms).
    pub created_at_ms: u64,
    #[serde(default)]
    pub status: SignalStatus,
}

impl Signal {
    /// Age relative to `now_ms`; zero for timestamps in the future.
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// Stop-loss, treating a zero level as absent.
    #[inline]
    pub fn effective_stop_loss(&self) -> Option<Price> {
        self.stop_loss.filter(|p| !p.is_zero())
    }

    /// Distance between entry and stop-loss, if a stop-loss is present.
    pub fn stop_distance(&self) -> Option<Decimal> {
        self.effective_stop_loss()
            .map(|sl| self.entry_price.distance(sl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Signal {
        Signal {
            id: "sig-1".to_string(),
            instrument: "EURUSD".into(),
            timeframe: Timeframe::H1,
            direction: Direction::Buy,
            confidence: dec!(80),
            entry_price: Price::new(dec!(1.1000)),
            stop_loss: Some(Price::new(dec!(1.0960))),
            take_profit: None,
            created_at_ms: 1_000,
            status: SignalStatus::Active,
        }
    }

    #[test]
    fn test_age_saturates() {
        let s = sample();
        assert_eq!(s.age_ms(1_500), 500);
        assert_eq!(s.age_ms(500), 0);
    }

    #[test]
    fn test_zero_stop_loss_is_absent() {
        let mut s = sample();
        assert_eq!(s.stop_distance(), Some(dec!(0.0040)));
        s.stop_loss = Some(Price::ZERO);
        assert!(s.effective_stop_loss().is_none());
        assert!(s.stop_distance().is_none());
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{
            "id": "s", "instrument": "XAUUSD", "timeframe": "M15", "direction": "SELL",
            "confidence": "72.5", "entry_price": "2400.10", "created_at_ms": 1
        }"#;
        let s: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(s.status, SignalStatus::Active);
        assert!(s.stop_loss.is_none());
        assert_eq!(s.direction, Direction::Sell);
    }
}
