//! Intake error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type IntakeResult<T> = Result<T, IntakeError>;
