//! Prometheus metrics and structured logging for tradegate.
//!
//! - Structured logging with tracing (JSON in production)
//! - Prometheus metrics for admissions, the circuit breaker and the
//!   command lifecycle

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
