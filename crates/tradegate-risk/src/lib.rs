//! Risk controls for trade admission.
//!
//! - `PositionSizer`: balance tier x confidence bucket x instrument factor
//! - `StopLossEnforcer`: stop-loss direction and per-trade loss cap
//! - `CircuitBreaker`: consecutive-failure and daily-loss trips with cooldown
//! - `ExposureTracker`: open-or-pending count per key, plus the per-key
//!   lock table that serializes same-key admissions in one process

pub mod breaker;
pub mod error;
pub mod exposure;
pub mod sizer;
pub mod stop_loss;

pub use breaker::{apply, BreakerConfig, BreakerEvent, BreakerTransition, CircuitBreaker};
pub use error::{RiskError, RiskResult};
pub use exposure::ExposureTracker;
pub use sizer::{BalanceTier, ConfidenceBucket, PositionSizer, SizingConfig};
pub use stop_loss::{StopLossEnforcer, StopLossVerdict};
