//! Admission and execution control.
//!
//! # Key Components
//!
//! - [`Dispatcher`]: admission pipeline for OPEN commands, MODIFY/CLOSE
//!   dispatch and cancellation for one account
//! - [`Evaluator`]: periodic loop feeding active signals to a dispatcher
//! - [`Reconciler`]: timeout sweep and settlement of command outcomes into
//!   the circuit breaker
//! - [`PaperGateway`]: simulated gateway for dry runs
//! - [`FailClosedLatch`]: refuses admissions after a storage failure
//! - [`ExecutionContext`]: components shared by all of the above
//!
//! # Gate Checks (in `Dispatcher::on_signal`)
//!
//! 1. FailClosed -> Rejected::StorageUnavailable
//! 2. Intake filters -> Rejected::{Inactive, UnknownInstrument, InstrumentPaused,
//!    FutureTimestamp, Stale, BelowConfidence}
//! 3. Dedup claim -> Rejected::Duplicate
//! 4. Exposure -> Rejected::ExposureLimitReached
//! 5. Sizing
//! 6. Stop-loss -> Rejected::{InvalidStopLoss, RiskLimitExceeded}
//! 7. Circuit breaker -> Rejected::CircuitBreakerOpen
//! 8. (all passed) -> per-key lock + transactional create

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod latch;
pub mod paper;
pub mod reconciler;

#[cfg(test)]
pub(crate) mod testkit;

pub use context::{ControllerSettings, ExecutionContext, PROCESS_ACCOUNT};
pub use dispatcher::Dispatcher;
pub use error::{ExecutorError, ExecutorResult};
pub use evaluator::{Evaluator, EvaluatorConfig, TickSummary};
pub use latch::FailClosedLatch;
pub use paper::{PaperConfig, PaperGateway, PaperPolicy, PollReport};
pub use reconciler::{Reconciler, ReconcilerConfig, SweepReport};
