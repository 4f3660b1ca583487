//! Core domain types for the tradegate admission controller.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - `Signal`, `Position`, `Command`: the records flowing through admission
//! - `Price`, `Volume`, `Money`: precision-safe numeric types
//! - `InstrumentBook`: per-instrument risk limits and contract metadata
//! - `RiskState`: per-account circuit-breaker state
//! - `AdmissionDecision`, `RejectReason`: outcome of evaluating a signal
//! - `AuditRecord`, `AuditSink`: structured decision log
//! - `Clock`: injectable millisecond time source

pub mod audit;
pub mod clock;
pub mod command;
pub mod decimal;
pub mod decision;
pub mod error;
pub mod instrument;
pub mod position;
pub mod risk_state;
pub mod signal;
pub mod types;

pub use audit::{AuditEvent, AuditRecord, AuditSink, NullAuditSink};
pub use clock::{next_utc_midnight_ms, utc_date, Clock, ManualClock, SystemClock};
pub use command::{
    gateway_failure_reason, Command, CommandPayload, CommandStatus, CommandToken, CommandType,
    FAILURE_CANCELLED, FAILURE_TIMEOUT,
};
pub use decimal::{Money, Price, Volume};
pub use decision::{AdmissionDecision, CommandFailure, ErrorKind, RejectReason};
pub use error::{CoreError, Result};
pub use instrument::{InstrumentBook, InstrumentEntry, InstrumentRiskConfig, InstrumentSpec};
pub use position::{Position, PositionStatus};
pub use risk_state::{BreakerState, RiskState, TripReason};
pub use signal::{Signal, SignalStatus};
pub use types::{AccountId, Direction, ExposureKey, Instrument, Timeframe};
