//! Store error types.

use thiserror::Error;
use tradegate_core::{CommandStatus, CoreError};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The "at most N open-or-pending entries per key" constraint rejected the write.
    #[error("Exposure limit reached for {key}")]
    ExposureConflict { key: String },

    /// An OPEN command for the same signal version already exists.
    #[error("Duplicate signal fingerprint: {0}")]
    DuplicateFingerprint(String),

    /// Optimistic concurrency check failed; reload and retry.
    #[error("Risk state version conflict for {account} (expected v{expected})")]
    VersionConflict { account: String, expected: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {token}: {from} -> {to}")]
    InvalidTransition {
        token: String,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors that mean durable state can no longer be trusted; the
    /// controller must stop admitting when it sees one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Backend(_) | Self::Corrupt(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(e.to_string())
            }
            sqlx::Error::RowNotFound => Self::NotFound(e.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self {
        Self::Corrupt(e.to_string())
    }
}

impl From<rust_decimal::Error> for StoreError {
    fn from(e: rust_decimal::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
