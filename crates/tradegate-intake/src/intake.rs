//! Signal screening.
//!
//! Filters run in a fixed order and the first failing filter decides the
//! reject reason. None of them touch the dedup cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use tradegate_core::{InstrumentBook, InstrumentEntry, RejectReason, Signal, SignalStatus};

use crate::error::{IntakeError, IntakeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Signals older than this are rejected as stale.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// Tolerated clock skew for signals stamped in the future.
    #[serde(default = "default_future_tolerance_secs")]
    pub future_tolerance_secs: u64,
    /// How long a processed fingerprint suppresses re-evaluation.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

fn default_staleness_secs() -> u64 {
    300
}

fn default_future_tolerance_secs() -> u64 {
    5
}

fn default_dedup_window_secs() -> u64 {
    3600
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            future_tolerance_secs: default_future_tolerance_secs(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

impl IntakeConfig {
    pub fn staleness_ms(&self) -> u64 {
        self.staleness_secs.saturating_mul(1000)
    }

    pub fn future_tolerance_ms(&self) -> u64 {
        self.future_tolerance_secs.saturating_mul(1000)
    }

    pub fn dedup_window_ms(&self) -> u64 {
        self.dedup_window_secs.saturating_mul(1000)
    }

    pub fn validate(&self) -> IntakeResult<()> {
        if self.staleness_secs == 0 {
            return Err(IntakeError::Config("staleness_secs must be positive".into()));
        }
        if self.dedup_window_secs < self.staleness_secs {
            return Err(IntakeError::Config(format!(
                "dedup_window_secs ({}) must cover staleness_secs ({})",
                self.dedup_window_secs, self.staleness_secs
            )));
        }
        Ok(())
    }
}

pub struct SignalIntake {
    config: IntakeConfig,
    book: Arc<InstrumentBook>,
}

impl SignalIntake {
    pub fn new(config: IntakeConfig, book: Arc<InstrumentBook>) -> Self {
        Self { config, book }
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    pub fn book(&self) -> &InstrumentBook {
        &self.book
    }

    /// Run the intake filters. On success returns the instrument entry the
    /// rest of the pipeline works with.
    ///
    /// Order: status, instrument known, paused, future timestamp, staleness,
    /// confidence.
    pub fn screen(&self, signal: &Signal, now_ms: u64) -> Result<&InstrumentEntry, RejectReason> {
        if signal.status != SignalStatus::Active {
            return Err(RejectReason::Inactive);
        }
        let Some(entry) = self.book.get(&signal.instrument) else {
            return Err(RejectReason::UnknownInstrument);
        };
        if entry.risk.paused {
            return Err(RejectReason::InstrumentPaused);
        }
        if signal.created_at_ms > now_ms.saturating_add(self.config.future_tolerance_ms()) {
            return Err(RejectReason::FutureTimestamp);
        }
        let age_ms = signal.age_ms(now_ms);
        if age_ms > self.config.staleness_ms() {
            trace!(signal_id = %signal.id, age_ms, "Signal stale");
            return Err(RejectReason::Stale);
        }
        if signal.confidence < entry.risk.min_confidence {
            trace!(
                signal_id = %signal.id,
                confidence = %signal.confidence,
                min_confidence = %entry.risk.min_confidence,
                "Signal below confidence threshold"
            );
            return Err(RejectReason::BelowConfidence);
        }
        Ok(entry)
    }
}
