//! Risk error types.

use thiserror::Error;
use tradegate_store::StoreError;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Risk state kept changing under us; the caller should treat the
    /// operation as failed and retry on the next tick.
    #[error("Risk state for {account} still contended after {attempts} attempts")]
    ConcurrencyExhausted { account: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RiskError {
    /// True when the underlying storage failed (fail-closed condition).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_fatal())
    }
}

pub type RiskResult<T> = Result<T, RiskError>;
