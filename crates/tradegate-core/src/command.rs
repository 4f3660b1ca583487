//! Execution commands handed to the gateway.
//!
//! A command is written once by the dispatcher with status `Pending` and is
//! afterwards advanced by the gateway (acknowledge, complete, reject) and by
//! the reconciler (timeout, settlement).

use crate::decimal::{Price, Volume};
use crate::error::CoreError;
use crate::types::{AccountId, Direction, ExposureKey, Instrument, Timeframe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Failure reason written by the reconciler when a command outlives its timeout.
pub const FAILURE_TIMEOUT: &str = "timeout";

/// Failure reason written when a pending command is cancelled before pickup.
pub const FAILURE_CANCELLED: &str = "cancelled";

/// Failure reason to store for a gateway rejection.
///
/// Gateway text that collides with a reason the controller writes itself
/// is prefixed, so a rejection is never mistaken for a cancel or timeout.
pub fn gateway_failure_reason(reason: &str) -> String {
    if reason == FAILURE_CANCELLED || reason == FAILURE_TIMEOUT {
        format!("gateway: {reason}")
    } else {
        reason.to_string()
    }
}

/// Client-generated command token.
///
/// This is the idempotency key shared with the gateway: a retried write
/// carrying the same token must never open a second trade.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandToken(String);

impl CommandToken {
    /// Create a new unique token.
    ///
    /// Format: `tg_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("tg_{ts}_{uuid_short}"))
    }

    /// Wrap an existing token (loaded from storage or received from the gateway).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommandToken {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for CommandToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the gateway is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandType {
    /// Open a new position.
    Open,
    /// Move stop-loss / take-profit of an open position.
    Modify,
    /// Close an open position.
    Close,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Modify => "MODIFY",
            Self::Close => "CLOSE",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "MODIFY" => Ok(Self::Modify),
            "CLOSE" => Ok(Self::Close),
            _ => Err(CoreError::UnknownVariant {
                kind: "command type",
                value: s.to_string(),
            }),
        }
    }
}

/// Command lifecycle: `Pending -> Processing -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Written by the dispatcher, not yet picked up by the gateway.
    Pending,
    /// Acknowledged by the gateway, execution in progress.
    Processing,
    /// Executed by the gateway.
    Completed,
    /// Rejected, timed out or cancelled.
    Failed,
}

impl CommandStatus {
    /// Returns true for states that count toward exposure and timeouts.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Returns true if the command reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::UnknownVariant {
                kind: "command status",
                value: s.to_string(),
            }),
        }
    }
}

/// Order parameters carried by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub volume: Volume,
    /// Reference entry price (OPEN only).
    pub entry_price: Option<Price>,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    /// Broker id of the position targeted by MODIFY / CLOSE.
    pub target_broker_id: Option<String>,
}

/// An execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub token: CommandToken,
    pub account: AccountId,
    pub command_type: CommandType,
    pub payload: CommandPayload,
    pub status: CommandStatus,
    /// Originating signal (OPEN only).
    pub signal_id: Option<String>,
    /// Fingerprint of the originating signal version (OPEN only).
    pub fingerprint: Option<String>,
    pub created_at_ms: u64,
    pub acknowledged_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub failure_reason: Option<String>,
    /// Broker-assigned id reported on completion.
    pub broker_id: Option<String>,
    pub fill_price: Option<Price>,
    /// Set once the outcome has been consumed by the reconciler.
    pub settled: bool,
}

impl Command {
    fn base(
        account: AccountId,
        command_type: CommandType,
        payload: CommandPayload,
        now_ms: u64,
    ) -> Self {
        Self {
            token: CommandToken::new(),
            account,
            command_type,
            payload,
            status: CommandStatus::Pending,
            signal_id: None,
            fingerprint: None,
            created_at_ms: now_ms,
            acknowledged_at_ms: None,
            completed_at_ms: None,
            failure_reason: None,
            broker_id: None,
            fill_price: None,
            settled: false,
        }
    }

    /// New OPEN command born from an admitted signal.
    pub fn open(
        account: AccountId,
        payload: CommandPayload,
        signal_id: String,
        fingerprint: String,
        now_ms: u64,
    ) -> Self {
        let mut cmd = Self::base(account, CommandType::Open, payload, now_ms);
        cmd.signal_id = Some(signal_id);
        cmd.fingerprint = Some(fingerprint);
        cmd
    }

    /// New MODIFY or CLOSE command targeting an existing position.
    pub fn for_position(
        account: AccountId,
        command_type: CommandType,
        payload: CommandPayload,
        now_ms: u64,
    ) -> Self {
        Self::base(account, command_type, payload, now_ms)
    }

    /// Exposure key this command is accounted under.
    pub fn exposure_key(&self) -> ExposureKey {
        ExposureKey::new(
            self.account.clone(),
            self.payload.instrument.clone(),
            self.payload.timeframe,
        )
    }

    /// Age relative to `now_ms`.
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// Returns true if this command was cancelled rather than failed by the gateway.
    pub fn is_cancelled(&self) -> bool {
        self.status == CommandStatus::Failed
            && self.failure_reason.as_deref() == Some(FAILURE_CANCELLED)
    }

    /// Returns true if this command failed because it outlived its timeout.
    pub fn is_timed_out(&self) -> bool {
        self.status == CommandStatus::Failed
            && self.failure_reason.as_deref() == Some(FAILURE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payload() -> CommandPayload {
        CommandPayload {
            instrument: "EURUSD".into(),
            timeframe: Timeframe::H1,
            direction: Direction::Buy,
            volume: Volume::new(dec!(0.01)),
            entry_price: Some(Price::new(dec!(1.1))),
            stop_loss: Some(Price::new(dec!(1.096))),
            take_profit: None,
            target_broker_id: None,
        }
    }

    #[test]
    fn test_command_token_unique() {
        let a = CommandToken::new();
        let b = CommandToken::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tg_"));
    }

    #[test]
    fn test_status_classification() {
        assert!(CommandStatus::Pending.is_in_flight());
        assert!(CommandStatus::Processing.is_in_flight());
        assert!(!CommandStatus::Completed.is_in_flight());
        assert!(CommandStatus::Failed.is_terminal());
        assert_eq!("processing".parse::<CommandStatus>().unwrap(), CommandStatus::Processing);
    }

    #[test]
    fn test_open_command_starts_pending() {
        let cmd = Command::open("acc".into(), payload(), "sig".into(), "fp".into(), 42);
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.command_type, CommandType::Open);
        assert_eq!(cmd.fingerprint.as_deref(), Some("fp"));
        assert!(!cmd.settled);
        assert_eq!(cmd.exposure_key().to_string(), "acc/EURUSD/H1");
    }

    #[test]
    fn test_failure_reason_helpers() {
        let mut cmd = Command::open("acc".into(), payload(), "sig".into(), "fp".into(), 0);
        cmd.status = CommandStatus::Failed;
        cmd.failure_reason = Some(FAILURE_CANCELLED.to_string());
        assert!(cmd.is_cancelled());
        assert!(!cmd.is_timed_out());
    }

    #[test]
    fn test_gateway_reason_never_collides() {
        assert_eq!(gateway_failure_reason("market closed"), "market closed");
        assert_eq!(gateway_failure_reason("cancelled"), "gateway: cancelled");
        assert_eq!(gateway_failure_reason("timeout"), "gateway: timeout");
    }
}
