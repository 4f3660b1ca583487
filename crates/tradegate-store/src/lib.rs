//! Durable state for tradegate.
//!
//! The [`Store`] trait is the consistency contract the controller relies on.
//! Any backend must provide:
//!
//! - **Exposure slots**: `create_open_command` atomically checks and claims
//!   one of `max_positions` slots for the command's (account, instrument,
//!   timeframe) key. This constraint is the final authority against
//!   concurrent over-admission; in-process locks only sit in front of it.
//! - **Fingerprint uniqueness**: at most one OPEN command per
//!   (account, signal fingerprint), so replaying a signal version never
//!   produces a second command, even across restarts.
//! - **Conditional transitions**: every lifecycle step (`acknowledge`,
//!   `complete`, `reject`, `expire`, `cancel`, `settle`) succeeds for exactly
//!   one caller and reports `false` to the others.
//! - **Compare-and-swap risk state**: `save_risk_state` fails with
//!   `VersionConflict` if another writer got there first.
//!
//! Backends: [`MemoryStore`] (one mutex, one operation = one transaction)
//! and [`SqliteStore`] (sqlx, `BEGIN IMMEDIATE` transactions and a partial
//! unique index over active slots).

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use tradegate_core::{
    AccountId, Command, CommandStatus, CommandToken, ExposureKey, Instrument, Money, Position,
    Price, RiskState, Signal,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round trip proving the backend is reachable.
    async fn health_check(&self) -> StoreResult<()>;

    // ------------------------------------------------------------------
    // Signal feed
    // ------------------------------------------------------------------

    /// Insert or replace a signal (feed write path).
    async fn upsert_signal(&self, signal: &Signal) -> StoreResult<()>;

    async fn get_signal(&self, id: &str) -> StoreResult<Option<Signal>>;

    /// Signals with status `active`, oldest first, optionally restricted to
    /// a set of instruments.
    async fn active_signals(&self, instruments: Option<&[Instrument]>)
        -> StoreResult<Vec<Signal>>;

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    async fn set_account_balance(&self, account: &AccountId, balance: Money) -> StoreResult<()>;

    /// Current balance; `NotFound` for unknown accounts.
    async fn account_balance(&self, account: &AccountId) -> StoreResult<Money>;

    // ------------------------------------------------------------------
    // Exposure and dispatch
    // ------------------------------------------------------------------

    /// Open positions plus in-flight (or completed but unsettled) OPEN
    /// commands for the key.
    async fn committed_count(&self, key: &ExposureKey) -> StoreResult<u32>;

    /// Persist a `pending` OPEN command, claiming an exposure slot in the
    /// same transaction.
    ///
    /// Fails with `DuplicateFingerprint` if the signal version was already
    /// dispatched for this account, and `ExposureConflict` if all
    /// `max_positions` slots are taken.
    async fn create_open_command(&self, command: &Command, max_positions: u32)
        -> StoreResult<()>;

    /// Persist a `pending` MODIFY or CLOSE command (no exposure accounting).
    async fn insert_command(&self, command: &Command) -> StoreResult<()>;

    async fn get_command(&self, token: &CommandToken) -> StoreResult<Option<Command>>;

    /// Commands in the given status, oldest first.
    async fn commands_with_status(&self, status: CommandStatus) -> StoreResult<Vec<Command>>;

    /// `pending -> failed("cancelled")`. Releases the slot and marks the
    /// command settled so it never reaches the breaker. Returns `false` if
    /// the command is no longer pending.
    async fn cancel_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool>;

    // ------------------------------------------------------------------
    // Gateway-facing transitions
    // ------------------------------------------------------------------

    /// `pending -> processing`.
    async fn acknowledge_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool>;

    /// `pending | processing -> completed`, recording the broker id. Broker
    /// ids must be unique per fill; settling an OPEN creates a position
    /// keyed by it.
    async fn complete_command(
        &self,
        token: &CommandToken,
        broker_id: &str,
        fill_price: Option<Price>,
        now_ms: u64,
    ) -> StoreResult<bool>;

    /// `pending | processing -> failed(reason)`. Releases the slot. Reasons
    /// the controller reserves for itself are stored prefixed, see
    /// [`tradegate_core::gateway_failure_reason`].
    async fn reject_command(
        &self,
        token: &CommandToken,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool>;

    /// `open -> closed` with realized P&L. Releases the position's slot.
    async fn close_position(
        &self,
        broker_id: &str,
        realized_pnl: Money,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool>;

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// `pending | processing -> failed("timeout")`. Releases the slot.
    /// Returns `true` only for the caller that performed the transition.
    async fn expire_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool>;

    /// Terminal commands whose outcome has not been consumed yet.
    async fn unsettled_commands(&self) -> StoreResult<Vec<Command>>;

    /// Consume a terminal command's outcome exactly once.
    ///
    /// For a completed OPEN this creates the position, hands the exposure
    /// slot over to it and marks the originating signal `executed`; for a
    /// completed MODIFY it applies the new levels to the target position.
    /// Returns the settled command to the one caller that flipped the flag.
    async fn settle_command(&self, token: &CommandToken, now_ms: u64)
        -> StoreResult<Option<Command>>;

    /// Closed positions whose realized P&L has not been consumed yet.
    async fn unsettled_closed_positions(&self) -> StoreResult<Vec<Position>>;

    /// Mark a closed position's P&L consumed. `true` for the first caller only.
    async fn settle_position_pnl(&self, broker_id: &str) -> StoreResult<bool>;

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    async fn open_positions(&self, account: &AccountId) -> StoreResult<Vec<Position>>;

    async fn get_position(&self, broker_id: &str) -> StoreResult<Option<Position>>;

    // ------------------------------------------------------------------
    // Risk state
    // ------------------------------------------------------------------

    /// Stored state, or a fresh version-0 state tracking `today`.
    async fn load_risk_state(&self, account: &AccountId, today: NaiveDate)
        -> StoreResult<RiskState>;

    /// Compare-and-swap on `state.version`; returns the stored state with
    /// its bumped version.
    async fn save_risk_state(&self, state: &RiskState) -> StoreResult<RiskState>;
}
