//! SQLite store via sqlx.
//!
//! Exposure is modelled as rows in `exposure_slots`; a partial unique index
//! over `(account, instrument, timeframe, slot) WHERE active = 1` makes the
//! database reject any second claim of the same slot, whichever process
//! issued it. Multi-statement operations run in a `BEGIN IMMEDIATE`
//! transaction so the writer lock is taken up front instead of on upgrade;
//! the transaction guard rolls back if the operation is dropped midway.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use tradegate_core::{
    gateway_failure_reason, AccountId, Command, CommandPayload, CommandStatus, CommandToken,
    CommandType, CoreError, ExposureKey, Instrument, Money, Position, Price, RiskState, Signal,
    SignalStatus, Volume, FAILURE_CANCELLED, FAILURE_TIMEOUT,
};

use crate::error::{StoreError, StoreResult};
use crate::Store;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS signals (
        id TEXT PRIMARY KEY,
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        direction TEXT NOT NULL,
        confidence TEXT NOT NULL,
        entry_price TEXT NOT NULL,
        stop_loss TEXT,
        take_profit TEXT,
        created_at_ms INTEGER NOT NULL,
        status TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_signals_status ON signals(status, created_at_ms)",
    "CREATE TABLE IF NOT EXISTS accounts (
        account TEXT PRIMARY KEY,
        balance TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS commands (
        token TEXT PRIMARY KEY,
        account TEXT NOT NULL,
        command_type TEXT NOT NULL,
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        direction TEXT NOT NULL,
        volume TEXT NOT NULL,
        entry_price TEXT,
        stop_loss TEXT,
        take_profit TEXT,
        target_broker_id TEXT,
        status TEXT NOT NULL,
        signal_id TEXT,
        fingerprint TEXT,
        created_at_ms INTEGER NOT NULL,
        acknowledged_at_ms INTEGER,
        completed_at_ms INTEGER,
        failure_reason TEXT,
        broker_id TEXT,
        fill_price TEXT,
        settled INTEGER NOT NULL DEFAULT 0,
        UNIQUE (account, fingerprint)
    )",
    "CREATE INDEX IF NOT EXISTS ix_commands_status ON commands(status, settled, created_at_ms)",
    "CREATE TABLE IF NOT EXISTS positions (
        broker_id TEXT PRIMARY KEY,
        account TEXT NOT NULL,
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        direction TEXT NOT NULL,
        volume TEXT NOT NULL,
        open_price TEXT NOT NULL,
        stop_loss TEXT,
        take_profit TEXT,
        status TEXT NOT NULL,
        signal_id TEXT,
        opened_at_ms INTEGER NOT NULL,
        closed_at_ms INTEGER,
        close_reason TEXT,
        realized_pnl TEXT,
        pnl_settled INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS exposure_slots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account TEXT NOT NULL,
        instrument TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        slot INTEGER NOT NULL,
        holder_kind TEXT NOT NULL,
        holder_id TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_exposure_active
        ON exposure_slots(account, instrument, timeframe, slot) WHERE active = 1",
    "CREATE INDEX IF NOT EXISTS ix_exposure_holder ON exposure_slots(holder_kind, holder_id, active)",
    "CREATE TABLE IF NOT EXISTS risk_state (
        account TEXT PRIMARY KEY,
        consecutive_failures INTEGER NOT NULL,
        daily_pnl TEXT NOT NULL,
        tripped INTEGER NOT NULL,
        tripped_at_ms INTEGER,
        cooldown_until_ms INTEGER,
        trip_reason TEXT,
        tracking_date TEXT NOT NULL,
        version INTEGER NOT NULL
    )",
];

const HOLDER_COMMAND: &str = "command";
const HOLDER_POSITION: &str = "position";

// ============================================================================
// Row helpers
// ============================================================================

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn ms(row: &SqliteRow, col: &str) -> StoreResult<u64> {
    let v: i64 = row.try_get(col)?;
    Ok(v.max(0) as u64)
}

fn opt_ms(row: &SqliteRow, col: &str) -> StoreResult<Option<u64>> {
    let v: Option<i64> = row.try_get(col)?;
    Ok(v.map(|v| v.max(0) as u64))
}

fn dec(row: &SqliteRow, col: &str) -> StoreResult<Decimal> {
    let s: String = row.try_get(col)?;
    Ok(Decimal::from_str(&s)?)
}

fn opt_dec(row: &SqliteRow, col: &str) -> StoreResult<Option<Decimal>> {
    let s: Option<String> = row.try_get(col)?;
    Ok(s.map(|s| Decimal::from_str(&s)).transpose()?)
}

fn parse<T>(row: &SqliteRow, col: &str) -> StoreResult<T>
where
    T: FromStr<Err = CoreError>,
{
    let s: String = row.try_get(col)?;
    Ok(s.parse::<T>()?)
}

fn signal_from_row(row: &SqliteRow) -> StoreResult<Signal> {
    Ok(Signal {
        id: row.try_get("id")?,
        instrument: Instrument::new(row.try_get::<String, _>("instrument")?),
        timeframe: parse(row, "timeframe")?,
        direction: parse(row, "direction")?,
        confidence: dec(row, "confidence")?,
        entry_price: Price::new(dec(row, "entry_price")?),
        stop_loss: opt_dec(row, "stop_loss")?.map(Price::new),
        take_profit: opt_dec(row, "take_profit")?.map(Price::new),
        created_at_ms: ms(row, "created_at_ms")?,
        status: parse(row, "status")?,
    })
}

fn command_from_row(row: &SqliteRow) -> StoreResult<Command> {
    Ok(Command {
        token: CommandToken::from_string(row.try_get("token")?),
        account: AccountId::new(row.try_get::<String, _>("account")?),
        command_type: parse(row, "command_type")?,
        payload: CommandPayload {
            instrument: Instrument::new(row.try_get::<String, _>("instrument")?),
            timeframe: parse(row, "timeframe")?,
            direction: parse(row, "direction")?,
            volume: Volume::new(dec(row, "volume")?),
            entry_price: opt_dec(row, "entry_price")?.map(Price::new),
            stop_loss: opt_dec(row, "stop_loss")?.map(Price::new),
            take_profit: opt_dec(row, "take_profit")?.map(Price::new),
            target_broker_id: row.try_get("target_broker_id")?,
        },
        status: parse(row, "status")?,
        signal_id: row.try_get("signal_id")?,
        fingerprint: row.try_get("fingerprint")?,
        created_at_ms: ms(row, "created_at_ms")?,
        acknowledged_at_ms: opt_ms(row, "acknowledged_at_ms")?,
        completed_at_ms: opt_ms(row, "completed_at_ms")?,
        failure_reason: row.try_get("failure_reason")?,
        broker_id: row.try_get("broker_id")?,
        fill_price: opt_dec(row, "fill_price")?.map(Price::new),
        settled: row.try_get("settled")?,
    })
}

fn position_from_row(row: &SqliteRow) -> StoreResult<Position> {
    Ok(Position {
        broker_id: row.try_get("broker_id")?,
        account: AccountId::new(row.try_get::<String, _>("account")?),
        instrument: Instrument::new(row.try_get::<String, _>("instrument")?),
        timeframe: parse(row, "timeframe")?,
        direction: parse(row, "direction")?,
        volume: Volume::new(dec(row, "volume")?),
        open_price: Price::new(dec(row, "open_price")?),
        stop_loss: opt_dec(row, "stop_loss")?.map(Price::new),
        take_profit: opt_dec(row, "take_profit")?.map(Price::new),
        status: parse(row, "status")?,
        signal_id: row.try_get("signal_id")?,
        opened_at_ms: ms(row, "opened_at_ms")?,
        closed_at_ms: opt_ms(row, "closed_at_ms")?,
        close_reason: row.try_get("close_reason")?,
        realized_pnl: opt_dec(row, "realized_pnl")?.map(Money::new),
        pnl_settled: row.try_get("pnl_settled")?,
    })
}

fn risk_state_from_row(row: &SqliteRow) -> StoreResult<RiskState> {
    let date: String = row.try_get("tracking_date")?;
    let tracking_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("tracking_date {date}: {e}")))?;
    let trip_reason: Option<String> = row.try_get("trip_reason")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    let version: i64 = row.try_get("version")?;
    Ok(RiskState {
        account: AccountId::new(row.try_get::<String, _>("account")?),
        consecutive_failures: u32::try_from(failures.max(0)).unwrap_or(u32::MAX),
        daily_pnl: Money::new(dec(row, "daily_pnl")?),
        tripped: row.try_get("tripped")?,
        tripped_at_ms: opt_ms(row, "tripped_at_ms")?,
        cooldown_until_ms: opt_ms(row, "cooldown_until_ms")?,
        trip_reason: trip_reason.map(|r| r.parse()).transpose()?,
        tracking_date,
        version: version.max(0) as u64,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ============================================================================
// SqliteStore
// ============================================================================

/// Store backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// In-memory databases are pinned to a single long-lived connection,
    /// since every SQLite connection would otherwise see its own empty
    /// database.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, in_memory, "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Open a write transaction. Dropping it uncommitted rolls back.
    async fn begin_immediate(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Commit on success, roll back on error.
    async fn finish<T>(tx: Transaction<'static, Sqlite>, result: StoreResult<T>) -> StoreResult<T> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn fetch_command(
        conn: &mut SqliteConnection,
        token: &CommandToken,
    ) -> StoreResult<Command> {
        let row = sqlx::query("SELECT * FROM commands WHERE token = ?")
            .bind(token.as_str())
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("command {token}")))?;
        command_from_row(&row)
    }

    async fn insert_command_row(conn: &mut SqliteConnection, cmd: &Command) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO commands (
                token, account, command_type, instrument, timeframe, direction, volume,
                entry_price, stop_loss, take_profit, target_broker_id, status, signal_id,
                fingerprint, created_at_ms, acknowledged_at_ms, completed_at_ms,
                failure_reason, broker_id, fill_price, settled
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cmd.token.as_str())
        .bind(cmd.account.as_str())
        .bind(cmd.command_type.as_str())
        .bind(cmd.payload.instrument.as_str())
        .bind(cmd.payload.timeframe.as_str())
        .bind(cmd.payload.direction.as_str())
        .bind(cmd.payload.volume.to_string())
        .bind(cmd.payload.entry_price.map(|p| p.to_string()))
        .bind(cmd.payload.stop_loss.map(|p| p.to_string()))
        .bind(cmd.payload.take_profit.map(|p| p.to_string()))
        .bind(cmd.payload.target_broker_id.as_deref())
        .bind(cmd.status.as_str())
        .bind(cmd.signal_id.as_deref())
        .bind(cmd.fingerprint.as_deref())
        .bind(to_i64(cmd.created_at_ms))
        .bind(cmd.acknowledged_at_ms.map(to_i64))
        .bind(cmd.completed_at_ms.map(to_i64))
        .bind(cmd.failure_reason.as_deref())
        .bind(cmd.broker_id.as_deref())
        .bind(cmd.fill_price.map(|p| p.to_string()))
        .bind(cmd.settled)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn release_slot(
        conn: &mut SqliteConnection,
        holder_kind: &str,
        holder_id: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE exposure_slots SET active = 0
             WHERE holder_kind = ? AND holder_id = ? AND active = 1",
        )
        .bind(holder_kind)
        .bind(holder_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn create_open_tx(
        conn: &mut SqliteConnection,
        command: &Command,
        max_positions: u32,
    ) -> StoreResult<()> {
        if let Some(fp) = &command.fingerprint {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM commands WHERE account = ? AND fingerprint = ?")
                    .bind(command.account.as_str())
                    .bind(fp)
                    .fetch_optional(&mut *conn)
                    .await?;
            if exists.is_some() {
                return Err(StoreError::DuplicateFingerprint(fp.clone()));
            }
        }

        let key = command.exposure_key();
        let taken: Vec<i64> = sqlx::query_scalar(
            "SELECT slot FROM exposure_slots
             WHERE account = ? AND instrument = ? AND timeframe = ? AND active = 1",
        )
        .bind(key.account.as_str())
        .bind(key.instrument.as_str())
        .bind(key.timeframe.as_str())
        .fetch_all(&mut *conn)
        .await?;

        let Some(slot) = (0..i64::from(max_positions)).find(|i| !taken.contains(i)) else {
            debug!(key = %key, taken = taken.len(), max_positions, "No free exposure slot");
            return Err(StoreError::ExposureConflict {
                key: key.to_string(),
            });
        };

        sqlx::query(
            "INSERT INTO exposure_slots (account, instrument, timeframe, slot, holder_kind, holder_id, active)
             VALUES (?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(key.account.as_str())
        .bind(key.instrument.as_str())
        .bind(key.timeframe.as_str())
        .bind(slot)
        .bind(HOLDER_COMMAND)
        .bind(command.token.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::ExposureConflict {
                    key: key.to_string(),
                }
            } else {
                e.into()
            }
        })?;

        Self::insert_command_row(conn, command).await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateFingerprint(command.fingerprint.clone().unwrap_or_default())
            } else {
                e.into()
            }
        })
    }

    /// Conditionally move an in-flight command to `failed`.
    async fn fail_in_flight_tx(
        conn: &mut SqliteConnection,
        token: &CommandToken,
        reason: &str,
        now_ms: u64,
        settled: bool,
        pending_only: bool,
    ) -> StoreResult<bool> {
        let cmd = Self::fetch_command(conn, token).await?;
        let allowed = if pending_only {
            cmd.status == CommandStatus::Pending
        } else {
            cmd.status.is_in_flight()
        };
        if !allowed {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE commands SET status = 'failed', failure_reason = ?, completed_at_ms = ?, settled = ?
             WHERE token = ?",
        )
        .bind(reason)
        .bind(to_i64(now_ms))
        .bind(settled)
        .bind(token.as_str())
        .execute(&mut *conn)
        .await?;
        if cmd.command_type == CommandType::Open {
            Self::release_slot(conn, HOLDER_COMMAND, token.as_str()).await?;
        }
        Ok(true)
    }

    async fn fail_in_flight(
        &self,
        token: &CommandToken,
        reason: &str,
        now_ms: u64,
        settled: bool,
        pending_only: bool,
    ) -> StoreResult<bool> {
        let mut tx = self.begin_immediate().await?;
        let result =
            Self::fail_in_flight_tx(&mut *tx, token, reason, now_ms, settled, pending_only).await;
        Self::finish(tx, result).await
    }

    async fn settle_tx(
        conn: &mut SqliteConnection,
        token: &CommandToken,
        now_ms: u64,
    ) -> StoreResult<Option<Command>> {
        let mut cmd = Self::fetch_command(conn, token).await?;
        if !cmd.status.is_terminal() || cmd.settled {
            return Ok(None);
        }
        sqlx::query("UPDATE commands SET settled = 1 WHERE token = ?")
            .bind(token.as_str())
            .execute(&mut *conn)
            .await?;
        cmd.settled = true;

        if cmd.status != CommandStatus::Completed {
            return Ok(Some(cmd));
        }

        match cmd.command_type {
            CommandType::Open => {
                let broker_id = cmd
                    .broker_id
                    .clone()
                    .unwrap_or_else(|| cmd.token.to_string());
                let open_price = cmd
                    .fill_price
                    .or(cmd.payload.entry_price)
                    .unwrap_or(Price::ZERO);
                sqlx::query(
                    "INSERT INTO positions (
                        broker_id, account, instrument, timeframe, direction, volume, open_price,
                        stop_loss, take_profit, status, signal_id, opened_at_ms, pnl_settled
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, 0)",
                )
                .bind(&broker_id)
                .bind(cmd.account.as_str())
                .bind(cmd.payload.instrument.as_str())
                .bind(cmd.payload.timeframe.as_str())
                .bind(cmd.payload.direction.as_str())
                .bind(cmd.payload.volume.to_string())
                .bind(open_price.to_string())
                .bind(cmd.payload.stop_loss.map(|p| p.to_string()))
                .bind(cmd.payload.take_profit.map(|p| p.to_string()))
                .bind(cmd.signal_id.as_deref())
                .bind(to_i64(cmd.completed_at_ms.unwrap_or(now_ms)))
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    "UPDATE exposure_slots SET holder_kind = ?, holder_id = ?
                     WHERE holder_kind = ? AND holder_id = ? AND active = 1",
                )
                .bind(HOLDER_POSITION)
                .bind(&broker_id)
                .bind(HOLDER_COMMAND)
                .bind(cmd.token.as_str())
                .execute(&mut *conn)
                .await?;

                if let Some(signal_id) = &cmd.signal_id {
                    sqlx::query("UPDATE signals SET status = ? WHERE id = ?")
                        .bind(SignalStatus::Executed.as_str())
                        .bind(signal_id)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            CommandType::Modify => {
                if let Some(target) = &cmd.payload.target_broker_id {
                    sqlx::query(
                        "UPDATE positions
                         SET stop_loss = COALESCE(?, stop_loss), take_profit = COALESCE(?, take_profit)
                         WHERE broker_id = ?",
                    )
                    .bind(cmd.payload.stop_loss.map(|p| p.to_string()))
                    .bind(cmd.payload.take_profit.map(|p| p.to_string()))
                    .bind(target)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            CommandType::Close => {}
        }
        Ok(Some(cmd))
    }

    async fn close_position_tx(
        conn: &mut SqliteConnection,
        broker_id: &str,
        realized_pnl: Money,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM positions WHERE broker_id = ?")
                .bind(broker_id)
                .fetch_optional(&mut *conn)
                .await?;
        match status.as_deref() {
            None => return Err(StoreError::NotFound(format!("position {broker_id}"))),
            Some("open") => {}
            Some(_) => return Ok(false),
        }
        sqlx::query(
            "UPDATE positions
             SET status = 'closed', closed_at_ms = ?, close_reason = ?, realized_pnl = ?
             WHERE broker_id = ?",
        )
        .bind(to_i64(now_ms))
        .bind(reason)
        .bind(realized_pnl.to_string())
        .bind(broker_id)
        .execute(&mut *conn)
        .await?;
        Self::release_slot(conn, HOLDER_POSITION, broker_id).await?;
        Ok(true)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_signal(&self, signal: &Signal) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO signals (
                id, instrument, timeframe, direction, confidence, entry_price, stop_loss,
                take_profit, created_at_ms, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                instrument = excluded.instrument,
                timeframe = excluded.timeframe,
                direction = excluded.direction,
                confidence = excluded.confidence,
                entry_price = excluded.entry_price,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                created_at_ms = excluded.created_at_ms,
                status = excluded.status",
        )
        .bind(&signal.id)
        .bind(signal.instrument.as_str())
        .bind(signal.timeframe.as_str())
        .bind(signal.direction.as_str())
        .bind(signal.confidence.to_string())
        .bind(signal.entry_price.to_string())
        .bind(signal.stop_loss.map(|p| p.to_string()))
        .bind(signal.take_profit.map(|p| p.to_string()))
        .bind(to_i64(signal.created_at_ms))
        .bind(signal.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> StoreResult<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(signal_from_row).transpose()
    }

    async fn active_signals(
        &self,
        instruments: Option<&[Instrument]>,
    ) -> StoreResult<Vec<Signal>> {
        let rows = sqlx::query("SELECT * FROM signals WHERE status = ? ORDER BY created_at_ms, id")
            .bind(SignalStatus::Active.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut signals = Vec::with_capacity(rows.len());
        for row in &rows {
            let signal = signal_from_row(row)?;
            if instruments.map_or(true, |set| set.contains(&signal.instrument)) {
                signals.push(signal);
            }
        }
        Ok(signals)
    }

    async fn set_account_balance(&self, account: &AccountId, balance: Money) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO accounts (account, balance) VALUES (?, ?)
             ON CONFLICT(account) DO UPDATE SET balance = excluded.balance",
        )
        .bind(account.as_str())
        .bind(balance.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn account_balance(&self, account: &AccountId) -> StoreResult<Money> {
        let balance: Option<String> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account = ?")
                .bind(account.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let balance = balance.ok_or_else(|| StoreError::NotFound(format!("account {account}")))?;
        Ok(Money::new(Decimal::from_str(&balance)?))
    }

    async fn committed_count(&self, key: &ExposureKey) -> StoreResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM exposure_slots
             WHERE account = ? AND instrument = ? AND timeframe = ? AND active = 1",
        )
        .bind(key.account.as_str())
        .bind(key.instrument.as_str())
        .bind(key.timeframe.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
    }

    async fn create_open_command(&self, command: &Command, max_positions: u32) -> StoreResult<()> {
        let mut tx = self.begin_immediate().await?;
        let result = Self::create_open_tx(&mut *tx, command, max_positions).await;
        Self::finish(tx, result).await
    }

    async fn insert_command(&self, command: &Command) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_command_row(&mut conn, command).await?;
        Ok(())
    }

    async fn get_command(&self, token: &CommandToken) -> StoreResult<Option<Command>> {
        let row = sqlx::query("SELECT * FROM commands WHERE token = ?")
            .bind(token.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    async fn commands_with_status(&self, status: CommandStatus) -> StoreResult<Vec<Command>> {
        let rows =
            sqlx::query("SELECT * FROM commands WHERE status = ? ORDER BY created_at_ms, token")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn cancel_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool> {
        self.fail_in_flight(token, FAILURE_CANCELLED, now_ms, true, true)
            .await
    }

    async fn acknowledge_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'processing', acknowledged_at_ms = ?
             WHERE token = ? AND status = 'pending'",
        )
        .bind(to_i64(now_ms))
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_command(token).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("command {token}"))),
        }
    }

    async fn complete_command(
        &self,
        token: &CommandToken,
        broker_id: &str,
        fill_price: Option<Price>,
        now_ms: u64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE commands
             SET status = 'completed', broker_id = ?, fill_price = ?, completed_at_ms = ?
             WHERE token = ? AND status IN ('pending', 'processing')",
        )
        .bind(broker_id)
        .bind(fill_price.map(|p| p.to_string()))
        .bind(to_i64(now_ms))
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_command(token).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("command {token}"))),
        }
    }

    async fn reject_command(
        &self,
        token: &CommandToken,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool> {
        self.fail_in_flight(token, &gateway_failure_reason(reason), now_ms, false, false)
            .await
    }

    async fn close_position(
        &self,
        broker_id: &str,
        realized_pnl: Money,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool> {
        let mut tx = self.begin_immediate().await?;
        let result =
            Self::close_position_tx(&mut *tx, broker_id, realized_pnl, reason, now_ms).await;
        Self::finish(tx, result).await
    }

    async fn expire_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool> {
        self.fail_in_flight(token, FAILURE_TIMEOUT, now_ms, false, false)
            .await
    }

    async fn unsettled_commands(&self) -> StoreResult<Vec<Command>> {
        let rows = sqlx::query(
            "SELECT * FROM commands
             WHERE status IN ('completed', 'failed') AND settled = 0
             ORDER BY created_at_ms, token",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    async fn settle_command(
        &self,
        token: &CommandToken,
        now_ms: u64,
    ) -> StoreResult<Option<Command>> {
        let mut tx = self.begin_immediate().await?;
        let result = Self::settle_tx(&mut *tx, token, now_ms).await;
        Self::finish(tx, result).await
    }

    async fn unsettled_closed_positions(&self) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status = 'closed' AND pnl_settled = 0
             ORDER BY closed_at_ms, broker_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn settle_position_pnl(&self, broker_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE positions SET pnl_settled = 1
             WHERE broker_id = ? AND status = 'closed' AND pnl_settled = 0",
        )
        .bind(broker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_position(broker_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("position {broker_id}"))),
        }
    }

    async fn open_positions(&self, account: &AccountId) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE account = ? AND status = 'open' ORDER BY opened_at_ms",
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    async fn get_position(&self, broker_id: &str) -> StoreResult<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE broker_id = ?")
            .bind(broker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn load_risk_state(
        &self,
        account: &AccountId,
        today: NaiveDate,
    ) -> StoreResult<RiskState> {
        let row = sqlx::query("SELECT * FROM risk_state WHERE account = ?")
            .bind(account.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => risk_state_from_row(&row),
            None => Ok(RiskState::new(account.clone(), today)),
        }
    }

    async fn save_risk_state(&self, state: &RiskState) -> StoreResult<RiskState> {
        let mut stored = state.clone();
        stored.version = state.version + 1;

        let result = if state.version == 0 {
            sqlx::query(
                "INSERT INTO risk_state (
                    account, consecutive_failures, daily_pnl, tripped, tripped_at_ms,
                    cooldown_until_ms, trip_reason, tracking_date, version
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(account) DO NOTHING",
            )
            .bind(stored.account.as_str())
            .bind(i64::from(stored.consecutive_failures))
            .bind(stored.daily_pnl.to_string())
            .bind(stored.tripped)
            .bind(stored.tripped_at_ms.map(to_i64))
            .bind(stored.cooldown_until_ms.map(to_i64))
            .bind(stored.trip_reason.map(|r| r.as_str()))
            .bind(stored.tracking_date.to_string())
            .bind(to_i64(stored.version))
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE risk_state SET
                    consecutive_failures = ?, daily_pnl = ?, tripped = ?, tripped_at_ms = ?,
                    cooldown_until_ms = ?, trip_reason = ?, tracking_date = ?, version = ?
                 WHERE account = ? AND version = ?",
            )
            .bind(i64::from(stored.consecutive_failures))
            .bind(stored.daily_pnl.to_string())
            .bind(stored.tripped)
            .bind(stored.tripped_at_ms.map(to_i64))
            .bind(stored.cooldown_until_ms.map(to_i64))
            .bind(stored.trip_reason.map(|r| r.as_str()))
            .bind(stored.tracking_date.to_string())
            .bind(to_i64(stored.version))
            .bind(stored.account.as_str())
            .bind(to_i64(state.version))
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() != 1 {
            return Err(StoreError::VersionConflict {
                account: state.account.to_string(),
                expected: state.version,
            });
        }
        Ok(stored)
    }
}
