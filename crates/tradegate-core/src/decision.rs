//! Admission outcomes and the failure taxonomy.

use crate::command::CommandToken;
use crate::decimal::{Money, Volume};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level failure taxonomy.
///
/// Every admission rejection maps onto one of the first four kinds; the last
/// two are command outcomes observed by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SignalRejected,
    ExposureLimitReached,
    RiskLimitExceeded,
    CircuitBreakerOpen,
    CommandTimeout,
    CommandRejectedByGateway,
    /// Durable storage lost; the controller fails closed.
    StorageUnavailable,
}

impl ErrorKind {
    /// Only gateway-side failures count toward the consecutive-failure limit.
    pub fn feeds_breaker(&self) -> bool {
        matches!(self, Self::CommandTimeout | Self::CommandRejectedByGateway)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalRejected => "signal_rejected",
            Self::ExposureLimitReached => "exposure_limit_reached",
            Self::RiskLimitExceeded => "risk_limit_exceeded",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::CommandTimeout => "command_timeout",
            Self::CommandRejectedByGateway => "command_rejected_by_gateway",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason for rejecting a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Signal status is not `active`.
    Inactive,
    /// Signal older than the staleness bound.
    Stale,
    /// Signal timestamp too far in the future.
    FutureTimestamp,
    /// Confidence below the instrument threshold.
    BelowConfidence,
    /// Same signal version already handled within the dedup window.
    Duplicate,
    /// Instrument is not configured.
    UnknownInstrument,
    /// Instrument paused by the performance monitor.
    InstrumentPaused,
    /// Stop-loss missing, zero or on the wrong side of entry.
    InvalidStopLoss,
    /// Open-or-pending entries already at the maximum for this key.
    ExposureLimitReached,
    /// Even the minimum volume would breach the loss cap.
    RiskLimitExceeded,
    /// Circuit breaker tripped.
    CircuitBreakerOpen,
    /// Durable storage unavailable (fail closed).
    StorageUnavailable,
}

impl RejectReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Inactive
            | Self::Stale
            | Self::FutureTimestamp
            | Self::BelowConfidence
            | Self::Duplicate
            | Self::UnknownInstrument
            | Self::InstrumentPaused
            | Self::InvalidStopLoss => ErrorKind::SignalRejected,
            Self::ExposureLimitReached => ErrorKind::ExposureLimitReached,
            Self::RiskLimitExceeded => ErrorKind::RiskLimitExceeded,
            Self::CircuitBreakerOpen => ErrorKind::CircuitBreakerOpen,
            Self::StorageUnavailable => ErrorKind::StorageUnavailable,
        }
    }

    /// Transient, global rejections: the signal version may be reconsidered
    /// once the condition clears, so it must not stay in the dedup cache.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CircuitBreakerOpen | Self::StorageUnavailable)
    }

    /// The same signal version would get this answer again, so a periodic
    /// evaluator need not present it a second time.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Inactive
                | Self::Stale
                | Self::Duplicate
                | Self::BelowConfidence
                | Self::UnknownInstrument
                | Self::InvalidStopLoss
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Stale => "stale",
            Self::FutureTimestamp => "future_timestamp",
            Self::BelowConfidence => "below_confidence",
            Self::Duplicate => "duplicate",
            Self::UnknownInstrument => "unknown_instrument",
            Self::InstrumentPaused => "instrument_paused",
            Self::InvalidStopLoss => "invalid_stop_loss",
            Self::ExposureLimitReached => "exposure_limit_reached",
            Self::RiskLimitExceeded => "risk_limit_exceeded",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway-side command failure, as observed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandFailure {
    Timeout,
    RejectedByGateway { reason: String },
}

impl CommandFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::CommandTimeout,
            Self::RejectedByGateway { .. } => ErrorKind::CommandRejectedByGateway,
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::RejectedByGateway { reason } => write!(f, "rejected by gateway: {reason}"),
        }
    }
}

/// Result of evaluating a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    /// Command persisted with status `pending`.
    Admitted {
        token: CommandToken,
        volume: Volume,
        /// Volume before the stop-loss enforcer shrank it, if it did.
        original_volume: Option<Volume>,
        potential_loss: Money,
    },
    /// Signal not admitted.
    Rejected { reason: RejectReason },
}

impl AdmissionDecision {
    #[must_use]
    pub fn rejected(reason: RejectReason) -> Self {
        Self::Rejected { reason }
    }

    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    #[must_use]
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected { reason } => Some(*reason),
            Self::Admitted { .. } => None,
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<&CommandToken> {
        match self {
            Self::Admitted { token, .. } => Some(token),
            Self::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_gateway_failures_feed_breaker() {
        assert!(ErrorKind::CommandTimeout.feeds_breaker());
        assert!(ErrorKind::CommandRejectedByGateway.feeds_breaker());
        assert!(!ErrorKind::SignalRejected.feeds_breaker());
        assert!(!ErrorKind::ExposureLimitReached.feeds_breaker());
        assert!(!ErrorKind::RiskLimitExceeded.feeds_breaker());
        assert!(!ErrorKind::CircuitBreakerOpen.feeds_breaker());
    }

    #[test]
    fn test_reject_reason_taxonomy() {
        assert_eq!(RejectReason::Stale.kind(), ErrorKind::SignalRejected);
        assert_eq!(RejectReason::Duplicate.kind(), ErrorKind::SignalRejected);
        assert_eq!(RejectReason::InvalidStopLoss.kind(), ErrorKind::SignalRejected);
        assert_eq!(
            RejectReason::ExposureLimitReached.kind(),
            ErrorKind::ExposureLimitReached
        );
        assert!(RejectReason::CircuitBreakerOpen.is_transient());
        assert!(!RejectReason::RiskLimitExceeded.is_transient());
        assert!(RejectReason::Stale.is_final());
        assert!(RejectReason::Duplicate.is_final());
        assert!(!RejectReason::CircuitBreakerOpen.is_final());
        assert!(!RejectReason::ExposureLimitReached.is_final());
    }

    #[test]
    fn test_decision_helpers() {
        let d = AdmissionDecision::rejected(RejectReason::Stale);
        assert!(!d.is_admitted());
        assert_eq!(d.reject_reason(), Some(RejectReason::Stale));
        assert!(d.token().is_none());
    }
}
