//! Structured audit records.
//!
//! Every admission decision, breaker transition and command timeout is
//! written through an [`AuditSink`] synchronously with the decision itself.

use crate::command::{CommandStatus, CommandToken, CommandType};
use crate::decimal::{Money, Volume};
use crate::decision::RejectReason;
use crate::risk_state::{BreakerState, TripReason};
use crate::types::{AccountId, Instrument, Timeframe};
use serde::{Deserialize, Serialize};

/// One audit log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at_ms: u64,
    pub account: AccountId,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(at_ms: u64, account: AccountId, event: AuditEvent) -> Self {
        Self {
            at_ms,
            account,
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Outcome of evaluating one signal.
    Admission {
        signal_id: String,
        instrument: Instrument,
        timeframe: Timeframe,
        fingerprint: Option<String>,
        admitted: bool,
        reason: Option<RejectReason>,
        token: Option<CommandToken>,
        volume: Option<Volume>,
        original_volume: Option<Volume>,
        potential_loss: Option<Money>,
    },
    /// Circuit-breaker state change (including a trip reason upgrade).
    BreakerTransition {
        from: BreakerState,
        to: BreakerState,
        trip_reason: Option<TripReason>,
        /// Why the transition happened (e.g. `cooldown_elapsed`, `manual_reset`).
        trigger: String,
        consecutive_failures: u32,
        daily_pnl: Money,
        resume_at_ms: Option<u64>,
    },
    /// A command outlived its timeout and was failed by the reconciler.
    CommandTimeout {
        token: CommandToken,
        command_type: CommandType,
        age_ms: u64,
    },
    /// Reconciler consumed a command outcome.
    CommandSettled {
        token: CommandToken,
        command_type: CommandType,
        status: CommandStatus,
        failure_reason: Option<String>,
        broker_id: Option<String>,
    },
    /// MODIFY or CLOSE command written.
    CommandDispatched {
        token: CommandToken,
        command_type: CommandType,
        target_broker_id: Option<String>,
    },
    CommandCancelled {
        token: CommandToken,
    },
    /// Storage failure latched the controller closed.
    FailClosed {
        error: String,
    },
    FailClosedCleared,
}

impl AuditEvent {
    /// Short event name, used as a log and metric label.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Admission { .. } => "admission",
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::CommandTimeout { .. } => "command_timeout",
            Self::CommandSettled { .. } => "command_settled",
            Self::CommandDispatched { .. } => "command_dispatched",
            Self::CommandCancelled { .. } => "command_cancelled",
            Self::FailClosed { .. } => "fail_closed",
            Self::FailClosedCleared => "fail_closed_cleared",
        }
    }
}

/// Destination for audit records.
///
/// Implementations must not fail the caller: write errors are logged and the
/// decision proceeds.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: &AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_flat_with_event_tag() {
        let record = AuditRecord::new(
            7,
            "acc".into(),
            AuditEvent::CommandCancelled {
                token: "tg_1_abcd".into(),
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "command_cancelled");
        assert_eq!(json["account"], "acc");
        assert_eq!(json["token"], "tg_1_abcd");

        let back: AuditRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_event_name() {
        assert_eq!(AuditEvent::FailClosedCleared.name(), "fail_closed_cleared");
    }
}
