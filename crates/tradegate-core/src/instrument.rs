//! Instrument risk limits and contract metadata.

use crate::decimal::{Money, Price, Volume};
use crate::error::{CoreError, Result};
use crate::types::Instrument;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-instrument risk limits. Read-only to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRiskConfig {
    /// Maximum worst-case loss of a single trade, in account currency.
    pub max_loss_per_trade: Money,
    /// Maximum open-or-pending entries per (account, instrument, timeframe).
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
    /// Signals below this confidence are rejected.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// Instrument risk factor applied by the sizer.
    #[serde(default = "default_risk_multiplier")]
    pub risk_multiplier: Decimal,
    /// Set by an external performance monitor; paused instruments admit nothing.
    #[serde(default)]
    pub paused: bool,
}

fn default_max_positions() -> u32 {
    1
}

fn default_min_confidence() -> Decimal {
    dec!(60)
}

fn default_risk_multiplier() -> Decimal {
    Decimal::ONE
}

/// Contract metadata needed to convert price distance into money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Decimal digits of quoted prices.
    pub price_precision: u32,
    /// Account currency per 1.0 price move per 1.0 volume.
    pub unit_value: Decimal,
    pub min_volume: Volume,
    pub max_volume: Volume,
    pub volume_step: Volume,
}

impl InstrumentSpec {
    /// Round a price to the quoted precision.
    pub fn round_price(&self, price: Price) -> Price {
        price.round_to_precision(self.price_precision)
    }

    /// Round down to the volume step, then clamp into `[min, max]`.
    pub fn normalize_volume(&self, volume: Volume) -> Volume {
        volume
            .round_down_to_step(self.volume_step)
            .clamp_to(self.min_volume, self.max_volume)
    }

    /// Worst-case loss of `volume` when price travels `distance` against the trade.
    #[inline]
    pub fn loss_for(&self, distance: Decimal, volume: Volume) -> Money {
        Money::new(distance * self.unit_value * volume.inner())
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_value <= Decimal::ZERO {
            return Err(CoreError::InvalidConfig("unit_value must be positive".into()));
        }
        if !self.volume_step.is_positive() {
            return Err(CoreError::InvalidConfig("volume_step must be positive".into()));
        }
        if !self.min_volume.is_positive() || self.min_volume > self.max_volume {
            return Err(CoreError::InvalidConfig(format!(
                "invalid volume range [{}, {}]",
                self.min_volume, self.max_volume
            )));
        }
        Ok(())
    }
}

/// Everything the controller knows about one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentEntry {
    pub instrument: Instrument,
    pub risk: InstrumentRiskConfig,
    pub spec: InstrumentSpec,
}

/// Lookup table of configured instruments.
#[derive(Debug, Clone, Default)]
pub struct InstrumentBook {
    entries: HashMap<Instrument, InstrumentEntry>,
}

impl InstrumentBook {
    pub fn new(entries: impl IntoIterator<Item = InstrumentEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.instrument.clone(), e))
                .collect(),
        }
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&InstrumentEntry> {
        self.entries.get(instrument)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd_spec() -> InstrumentSpec {
        InstrumentSpec {
            price_precision: 5,
            unit_value: dec!(100000),
            min_volume: Volume::new(dec!(0.01)),
            max_volume: Volume::new(dec!(10)),
            volume_step: Volume::new(dec!(0.01)),
        }
    }

    #[test]
    fn test_normalize_volume() {
        let spec = eurusd_spec();
        assert_eq!(spec.normalize_volume(Volume::new(dec!(0.237))), Volume::new(dec!(0.23)));
        assert_eq!(spec.normalize_volume(Volume::new(dec!(0.004))), Volume::new(dec!(0.01)));
        assert_eq!(spec.normalize_volume(Volume::new(dec!(25))), Volume::new(dec!(10)));
    }

    #[test]
    fn test_loss_for() {
        let spec = eurusd_spec();
        let loss = spec.loss_for(dec!(0.0040), Volume::new(dec!(0.01)));
        assert_eq!(loss, Money::new(dec!(4)));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut spec = eurusd_spec();
        assert!(spec.validate().is_ok());
        spec.min_volume = Volume::new(dec!(20));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_risk_config_defaults() {
        let cfg: InstrumentRiskConfig =
            serde_json::from_str(r#"{"max_loss_per_trade": "5"}"#).unwrap();
        assert_eq!(cfg.max_positions, 1);
        assert_eq!(cfg.min_confidence, dec!(60));
        assert_eq!(cfg.risk_multiplier, Decimal::ONE);
        assert!(!cfg.paused);
    }
}
