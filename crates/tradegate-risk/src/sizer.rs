//! Position sizing.
//!
//! `volume = balance x base_risk_fraction x confidence_mult x instrument_factor
//!           / (stop_distance x unit_value)`
//!
//! clamped to the instrument's and the balance tier's volume range and
//! rounded down to the volume step.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::trace;

use tradegate_core::{InstrumentRiskConfig, InstrumentSpec, Money, Volume};

use crate::error::{RiskError, RiskResult};

// ============================================================================
// Configuration
// ============================================================================

/// One row of the balance-tier table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTier {
    /// Tier applies from this balance upwards.
    pub min_balance: Money,
    /// Fallback volume when no stop distance is available.
    pub base_volume: Volume,
    /// Upper bound on any volume sized in this tier.
    pub max_volume: Volume,
}

/// Confidence at or above `min_confidence` scales risk by `multiplier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceBucket {
    pub min_confidence: Decimal,
    pub multiplier: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Fraction of the balance put at risk per trade before multipliers.
    #[serde(default = "default_base_risk_fraction")]
    pub base_risk_fraction: Decimal,
    /// Sorted by ascending `min_balance`.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<BalanceTier>,
    #[serde(default = "default_confidence_buckets")]
    pub confidence_buckets: Vec<ConfidenceBucket>,
}

fn default_base_risk_fraction() -> Decimal {
    dec!(0.01)
}

fn default_tiers() -> Vec<BalanceTier> {
    vec![
        BalanceTier {
            min_balance: Money::ZERO,
            base_volume: Volume::new(dec!(0.01)),
            max_volume: Volume::new(dec!(0.05)),
        },
        BalanceTier {
            min_balance: Money::new(dec!(1000)),
            base_volume: Volume::new(dec!(0.02)),
            max_volume: Volume::new(dec!(0.20)),
        },
        BalanceTier {
            min_balance: Money::new(dec!(5000)),
            base_volume: Volume::new(dec!(0.05)),
            max_volume: Volume::new(dec!(0.50)),
        },
        BalanceTier {
            min_balance: Money::new(dec!(20000)),
            base_volume: Volume::new(dec!(0.10)),
            max_volume: Volume::new(dec!(2.00)),
        },
    ]
}

fn default_confidence_buckets() -> Vec<ConfidenceBucket> {
    [
        (dec!(85), dec!(1.5)),
        (dec!(75), dec!(1.2)),
        (dec!(60), dec!(1.0)),
        (dec!(50), dec!(0.7)),
        (dec!(0), dec!(0.5)),
    ]
    .into_iter()
    .map(|(min_confidence, multiplier)| ConfidenceBucket {
        min_confidence,
        multiplier,
    })
    .collect()
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_risk_fraction: default_base_risk_fraction(),
            tiers: default_tiers(),
            confidence_buckets: default_confidence_buckets(),
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> RiskResult<()> {
        if self.base_risk_fraction <= Decimal::ZERO || self.base_risk_fraction > Decimal::ONE {
            return Err(RiskError::Config(format!(
                "base_risk_fraction must be in (0, 1], got {}",
                self.base_risk_fraction
            )));
        }
        if self.tiers.is_empty() {
            return Err(RiskError::Config("balance tier table is empty".into()));
        }
        if self
            .tiers
            .windows(2)
            .any(|w| w[0].min_balance >= w[1].min_balance)
        {
            return Err(RiskError::Config(
                "balance tiers must be sorted by strictly ascending min_balance".into(),
            ));
        }
        if let Some(tier) = self
            .tiers
            .iter()
            .find(|t| !t.base_volume.is_positive() || t.base_volume > t.max_volume)
        {
            return Err(RiskError::Config(format!(
                "tier from {} has invalid volumes (base {}, max {})",
                tier.min_balance, tier.base_volume, tier.max_volume
            )));
        }
        if self.confidence_buckets.is_empty() {
            return Err(RiskError::Config("confidence bucket table is empty".into()));
        }
        if self
            .confidence_buckets
            .iter()
            .any(|b| b.multiplier <= Decimal::ZERO)
        {
            return Err(RiskError::Config(
                "confidence multipliers must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// PositionSizer
// ============================================================================

/// Deterministic, side-effect free volume calculation.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    /// Buckets are re-sorted by descending threshold so lookup is a first match.
    pub fn new(mut config: SizingConfig) -> Self {
        config
            .confidence_buckets
            .sort_by(|a, b| b.min_confidence.cmp(&a.min_confidence));
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Highest tier whose `min_balance` the balance reaches; the first tier
    /// for balances below every threshold.
    pub fn tier_for(&self, balance: Money) -> Option<&BalanceTier> {
        self.config
            .tiers
            .iter()
            .rev()
            .find(|t| balance >= t.min_balance)
            .or_else(|| self.config.tiers.first())
    }

    /// Multiplier of the first bucket the confidence reaches.
    pub fn confidence_multiplier(&self, confidence: Decimal) -> Decimal {
        self.config
            .confidence_buckets
            .iter()
            .find(|b| confidence >= b.min_confidence)
            .or_else(|| self.config.confidence_buckets.last())
            .map(|b| b.multiplier)
            .unwrap_or(Decimal::ONE)
    }

    /// Volume for a trade of `confidence` with the given stop distance.
    pub fn size(
        &self,
        balance: Money,
        confidence: Decimal,
        risk: &InstrumentRiskConfig,
        spec: &InstrumentSpec,
        stop_distance: Decimal,
    ) -> Volume {
        if !balance.is_positive() {
            return spec.min_volume;
        }
        let Some(tier) = self.tier_for(balance) else {
            return spec.min_volume;
        };

        let confidence_mult = self.confidence_multiplier(confidence);
        let instrument_factor = risk.risk_multiplier;

        // The tier may not push the ceiling below the instrument minimum.
        let max = tier.max_volume.min(spec.max_volume).max(spec.min_volume);

        let raw = if stop_distance > Decimal::ZERO && spec.unit_value > Decimal::ZERO {
            // Overflow only happens for volumes far above any ceiling.
            balance
                .inner()
                .checked_mul(self.config.base_risk_fraction)
                .and_then(|v| v.checked_mul(confidence_mult))
                .and_then(|v| v.checked_mul(instrument_factor))
                .zip(stop_distance.checked_mul(spec.unit_value))
                .and_then(|(risk_amount, per_unit)| risk_amount.checked_div(per_unit))
                .unwrap_or(max.inner())
        } else {
            tier.base_volume.inner() * confidence_mult * instrument_factor
        };

        let volume = Volume::new(raw.min(max.inner()))
            .round_down_to_step(spec.volume_step)
            .clamp_to(spec.min_volume, max);

        trace!(
            balance = %balance,
            confidence = %confidence,
            confidence_mult = %confidence_mult,
            instrument_factor = %instrument_factor,
            raw = %raw,
            volume = %volume,
            "Sized position"
        );
        volume
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(SizingConfig::default())
    }
}
