//! Executor error types.

use thiserror::Error;
use tradegate_core::RejectReason;
use tradegate_risk::RiskError;
use tradegate_store::StoreError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    /// Storage failed earlier and health has not been re-established.
    #[error("Controller is fail-closed: {0}")]
    FailClosed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    /// A MODIFY or CLOSE request failed validation.
    #[error("Request rejected: {0}")]
    Rejected(RejectReason),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ExecutorError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(e) => e.is_fatal(),
            Self::Risk(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
