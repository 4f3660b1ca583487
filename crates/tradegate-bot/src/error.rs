//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] tradegate_store::StoreError),

    #[error("Risk error: {0}")]
    Risk(#[from] tradegate_risk::RiskError),

    #[error("Intake error: {0}")]
    Intake(#[from] tradegate_intake::IntakeError),

    #[error("Executor error: {0}")]
    Executor(#[from] tradegate_executor::ExecutorError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] tradegate_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] tradegate_persistence::PersistenceError),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<tradegate_core::CoreError> for AppError {
    fn from(e: tradegate_core::CoreError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
