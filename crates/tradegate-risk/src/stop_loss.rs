//! Stop-loss enforcement.
//!
//! A trade is only dispatched with a stop-loss on the protective side of
//! entry and a worst-case loss within the instrument cap. Oversized trades
//! are shrunk to the largest step-aligned volume that fits; price levels are
//! never touched.

use rust_decimal::Decimal;
use tracing::debug;

use tradegate_core::{
    Direction, InstrumentRiskConfig, InstrumentSpec, Money, Position, Price, RejectReason, Volume,
};

/// Outcome of validating a proposed trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopLossVerdict {
    /// Volume fits the cap as proposed.
    Accept { volume: Volume, potential_loss: Money },
    /// Volume was reduced to fit the cap.
    Adjust {
        original: Volume,
        volume: Volume,
        potential_loss: Money,
    },
    Reject { reason: RejectReason },
}

impl StopLossVerdict {
    fn reject(reason: RejectReason) -> Self {
        Self::Reject { reason }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopLossEnforcer;

impl StopLossEnforcer {
    pub fn new() -> Self {
        Self
    }

    /// True if `stop_loss` protects a `direction` trade entered at `entry`.
    pub fn is_protective(direction: Direction, entry: Price, stop_loss: Price) -> bool {
        match direction {
            Direction::Buy => stop_loss < entry,
            Direction::Sell => stop_loss > entry,
        }
    }

    /// `|entry - stop| x unit_value x volume`.
    pub fn potential_loss(
        entry: Price,
        stop_loss: Price,
        volume: Volume,
        spec: &InstrumentSpec,
    ) -> Money {
        spec.loss_for(entry.distance(stop_loss), volume)
    }

    pub fn validate(
        &self,
        entry: Price,
        stop_loss: Option<Price>,
        direction: Direction,
        volume: Volume,
        risk: &InstrumentRiskConfig,
        spec: &InstrumentSpec,
    ) -> StopLossVerdict {
        if !entry.is_positive() || !volume.is_positive() {
            return StopLossVerdict::reject(RejectReason::InvalidStopLoss);
        }
        let Some(stop_loss) = stop_loss.filter(|sl| sl.is_positive()) else {
            return StopLossVerdict::reject(RejectReason::InvalidStopLoss);
        };
        if !Self::is_protective(direction, entry, stop_loss) {
            debug!(
                direction = %direction,
                entry = %entry,
                stop_loss = %stop_loss,
                "Stop-loss on the wrong side of entry"
            );
            return StopLossVerdict::reject(RejectReason::InvalidStopLoss);
        }

        let cap = risk.max_loss_per_trade;
        let potential_loss = Self::potential_loss(entry, stop_loss, volume, spec);
        if potential_loss <= cap {
            return StopLossVerdict::Accept {
                volume,
                potential_loss,
            };
        }

        // Largest volume whose loss fits the cap, rounded down to the step.
        let loss_per_unit = entry
            .distance(stop_loss)
            .checked_mul(spec.unit_value)
            .unwrap_or(Decimal::ZERO);
        if !cap.is_positive() || loss_per_unit <= Decimal::ZERO {
            return StopLossVerdict::reject(RejectReason::RiskLimitExceeded);
        }
        let fitted = Volume::new(cap.inner() / loss_per_unit).round_down_to_step(spec.volume_step);
        if fitted < spec.min_volume {
            debug!(
                cap = %cap,
                potential_loss = %potential_loss,
                min_volume = %spec.min_volume,
                "Minimum volume breaches loss cap"
            );
            return StopLossVerdict::reject(RejectReason::RiskLimitExceeded);
        }

        let fitted = fitted.min(volume);
        StopLossVerdict::Adjust {
            original: volume,
            volume: fitted,
            potential_loss: Self::potential_loss(entry, stop_loss, fitted, spec),
        }
    }

    /// Validate a new stop-loss for an existing position.
    ///
    /// The position's volume is fixed, so a loss above the cap is a reject.
    pub fn validate_modify(
        &self,
        position: &Position,
        new_stop_loss: Price,
        risk: &InstrumentRiskConfig,
        spec: &InstrumentSpec,
    ) -> Result<Money, RejectReason> {
        if !new_stop_loss.is_positive()
            || !Self::is_protective(position.direction, position.open_price, new_stop_loss)
        {
            return Err(RejectReason::InvalidStopLoss);
        }
        let loss = Self::potential_loss(position.open_price, new_stop_loss, position.volume, spec);
        if loss > risk.max_loss_per_trade {
            return Err(RejectReason::RiskLimitExceeded);
        }
        Ok(loss)
    }
}
