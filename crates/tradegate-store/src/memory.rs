//! In-process store.
//!
//! All state lives behind a single `parking_lot::Mutex`; every trait method
//! takes the lock once, so each operation is atomic with respect to the
//! others. Used by tests, dry runs and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::debug;

use tradegate_core::{
    gateway_failure_reason, AccountId, Command, CommandStatus, CommandToken, CommandType,
    ExposureKey, Instrument, Money, Position, PositionStatus, Price, RiskState, Signal,
    SignalStatus, FAILURE_CANCELLED, FAILURE_TIMEOUT,
};

use crate::error::{StoreError, StoreResult};
use crate::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotHolder {
    Command(CommandToken),
    Position(String),
}

#[derive(Debug, Clone)]
struct Slot {
    index: u32,
    holder: SlotHolder,
}

#[derive(Default)]
struct Inner {
    signals: HashMap<String, Signal>,
    balances: HashMap<AccountId, Money>,
    commands: HashMap<CommandToken, Command>,
    fingerprints: HashSet<(AccountId, String)>,
    positions: HashMap<String, Position>,
    /// Active exposure slots per key.
    slots: HashMap<ExposureKey, Vec<Slot>>,
    risk: HashMap<AccountId, RiskState>,
}

impl Inner {
    fn release_slot(&mut self, key: &ExposureKey, holder: &SlotHolder) {
        if let Some(slots) = self.slots.get_mut(key) {
            slots.retain(|s| &s.holder != holder);
            if slots.is_empty() {
                self.slots.remove(key);
            }
        }
    }

    fn transfer_slot(&mut self, key: &ExposureKey, from: &SlotHolder, to: SlotHolder) {
        if let Some(slot) = self
            .slots
            .get_mut(key)
            .and_then(|slots| slots.iter_mut().find(|s| &s.holder == from))
        {
            slot.holder = to;
        }
    }

    fn command_mut(&mut self, token: &CommandToken) -> StoreResult<&mut Command> {
        self.commands
            .get_mut(token)
            .ok_or_else(|| StoreError::NotFound(format!("command {token}")))
    }

    /// Move an in-flight command to `failed` and free its slot.
    fn fail_in_flight(
        &mut self,
        token: &CommandToken,
        reason: &str,
        now_ms: u64,
        settled: bool,
    ) -> StoreResult<bool> {
        let cmd = self.command_mut(token)?;
        if !cmd.status.is_in_flight() {
            return Ok(false);
        }
        cmd.status = CommandStatus::Failed;
        cmd.failure_reason = Some(reason.to_string());
        cmd.completed_at_ms = Some(now_ms);
        cmd.settled = settled;
        let is_open = cmd.command_type == CommandType::Open;
        let key = cmd.exposure_key();
        if is_open {
            self.release_slot(&key, &SlotHolder::Command(token.clone()));
        }
        Ok(true)
    }
}

/// Store backed by process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    failing_risk_saves: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            failing_risk_saves: AtomicU32::new(0),
        }
    }

    /// Simulate losing (or regaining) the backend. While unavailable every
    /// operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` risk-state saves with `StoreError::Unavailable`
    /// while everything else keeps working.
    pub fn fail_next_risk_saves(&self, n: u32) {
        self.failing_risk_saves.store(n, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    /// Every command, oldest first.
    pub fn all_commands(&self) -> Vec<Command> {
        let inner = self.inner.lock();
        let mut commands: Vec<Command> = inner.commands.values().cloned().collect();
        commands.sort_by_key(|c| c.created_at_ms);
        commands
    }
}

fn sorted_by_created(mut commands: Vec<Command>) -> Vec<Command> {
    commands.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.token.cmp(&b.token))
    });
    commands
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_available()
    }

    async fn upsert_signal(&self, signal: &Signal) -> StoreResult<()> {
        self.ensure_available()?;
        self.inner
            .lock()
            .signals
            .insert(signal.id.clone(), signal.clone());
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> StoreResult<Option<Signal>> {
        self.ensure_available()?;
        Ok(self.inner.lock().signals.get(id).cloned())
    }

    async fn active_signals(
        &self,
        instruments: Option<&[Instrument]>,
    ) -> StoreResult<Vec<Signal>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        let mut signals: Vec<Signal> = inner
            .signals
            .values()
            .filter(|s| s.status == SignalStatus::Active)
            .filter(|s| instruments.map_or(true, |set| set.contains(&s.instrument)))
            .cloned()
            .collect();
        signals.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(signals)
    }

    async fn set_account_balance(&self, account: &AccountId, balance: Money) -> StoreResult<()> {
        self.ensure_available()?;
        self.inner.lock().balances.insert(account.clone(), balance);
        Ok(())
    }

    async fn account_balance(&self, account: &AccountId) -> StoreResult<Money> {
        self.ensure_available()?;
        self.inner
            .lock()
            .balances
            .get(account)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("account {account}")))
    }

    async fn committed_count(&self, key: &ExposureKey) -> StoreResult<u32> {
        self.ensure_available()?;
        Ok(self
            .inner
            .lock()
            .slots
            .get(key)
            .map_or(0, |slots| slots.len() as u32))
    }

    async fn create_open_command(&self, command: &Command, max_positions: u32) -> StoreResult<()> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();

        if let Some(fp) = &command.fingerprint {
            if inner
                .fingerprints
                .contains(&(command.account.clone(), fp.clone()))
            {
                return Err(StoreError::DuplicateFingerprint(fp.clone()));
            }
        }

        let key = command.exposure_key();
        let taken: Vec<u32> = inner
            .slots
            .get(&key)
            .map(|slots| slots.iter().map(|s| s.index).collect())
            .unwrap_or_default();
        let free = (0..max_positions).find(|i| !taken.contains(i));
        let Some(index) = free else {
            debug!(key = %key, taken = taken.len(), max_positions, "No free exposure slot");
            return Err(StoreError::ExposureConflict {
                key: key.to_string(),
            });
        };

        inner.slots.entry(key).or_default().push(Slot {
            index,
            holder: SlotHolder::Command(command.token.clone()),
        });
        if let Some(fp) = &command.fingerprint {
            inner
                .fingerprints
                .insert((command.account.clone(), fp.clone()));
        }
        inner
            .commands
            .insert(command.token.clone(), command.clone());
        Ok(())
    }

    async fn insert_command(&self, command: &Command) -> StoreResult<()> {
        self.ensure_available()?;
        self.inner
            .lock()
            .commands
            .insert(command.token.clone(), command.clone());
        Ok(())
    }

    async fn get_command(&self, token: &CommandToken) -> StoreResult<Option<Command>> {
        self.ensure_available()?;
        Ok(self.inner.lock().commands.get(token).cloned())
    }

    async fn commands_with_status(&self, status: CommandStatus) -> StoreResult<Vec<Command>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        Ok(sorted_by_created(
            inner
                .commands
                .values()
                .filter(|c| c.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn cancel_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        if inner.command_mut(token)?.status != CommandStatus::Pending {
            return Ok(false);
        }
        inner.fail_in_flight(token, FAILURE_CANCELLED, now_ms, true)
    }

    async fn acknowledge_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        let cmd = inner.command_mut(token)?;
        if cmd.status != CommandStatus::Pending {
            return Ok(false);
        }
        cmd.status = CommandStatus::Processing;
        cmd.acknowledged_at_ms = Some(now_ms);
        Ok(true)
    }

    async fn complete_command(
        &self,
        token: &CommandToken,
        broker_id: &str,
        fill_price: Option<Price>,
        now_ms: u64,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        let cmd = inner.command_mut(token)?;
        if !cmd.status.is_in_flight() {
            return Ok(false);
        }
        cmd.status = CommandStatus::Completed;
        cmd.broker_id = Some(broker_id.to_string());
        cmd.fill_price = fill_price;
        cmd.completed_at_ms = Some(now_ms);
        Ok(true)
    }

    async fn reject_command(
        &self,
        token: &CommandToken,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        self.inner
            .lock()
            .fail_in_flight(token, &gateway_failure_reason(reason), now_ms, false)
    }

    async fn close_position(
        &self,
        broker_id: &str,
        realized_pnl: Money,
        reason: &str,
        now_ms: u64,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        let position = inner
            .positions
            .get_mut(broker_id)
            .ok_or_else(|| StoreError::NotFound(format!("position {broker_id}")))?;
        if position.status != PositionStatus::Open {
            return Ok(false);
        }
        position.status = PositionStatus::Closed;
        position.closed_at_ms = Some(now_ms);
        position.close_reason = Some(reason.to_string());
        position.realized_pnl = Some(realized_pnl);
        let key = position.exposure_key();
        inner.release_slot(&key, &SlotHolder::Position(broker_id.to_string()));
        Ok(true)
    }

    async fn expire_command(&self, token: &CommandToken, now_ms: u64) -> StoreResult<bool> {
        self.ensure_available()?;
        self.inner
            .lock()
            .fail_in_flight(token, FAILURE_TIMEOUT, now_ms, false)
    }

    async fn unsettled_commands(&self) -> StoreResult<Vec<Command>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        Ok(sorted_by_created(
            inner
                .commands
                .values()
                .filter(|c| c.status.is_terminal() && !c.settled)
                .cloned()
                .collect(),
        ))
    }

    async fn settle_command(
        &self,
        token: &CommandToken,
        now_ms: u64,
    ) -> StoreResult<Option<Command>> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        let cmd = inner.command_mut(token)?;
        if !cmd.status.is_terminal() || cmd.settled {
            return Ok(None);
        }
        cmd.settled = true;
        let cmd = cmd.clone();

        if cmd.status == CommandStatus::Completed {
            match cmd.command_type {
                CommandType::Open => {
                    let broker_id = cmd
                        .broker_id
                        .clone()
                        .unwrap_or_else(|| cmd.token.to_string());
                    let position = Position {
                        broker_id: broker_id.clone(),
                        account: cmd.account.clone(),
                        instrument: cmd.payload.instrument.clone(),
                        timeframe: cmd.payload.timeframe,
                        direction: cmd.payload.direction,
                        volume: cmd.payload.volume,
                        open_price: cmd
                            .fill_price
                            .or(cmd.payload.entry_price)
                            .unwrap_or(Price::ZERO),
                        stop_loss: cmd.payload.stop_loss,
                        take_profit: cmd.payload.take_profit,
                        status: PositionStatus::Open,
                        signal_id: cmd.signal_id.clone(),
                        opened_at_ms: cmd.completed_at_ms.unwrap_or(now_ms),
                        closed_at_ms: None,
                        close_reason: None,
                        realized_pnl: None,
                        pnl_settled: false,
                    };
                    inner.positions.insert(broker_id.clone(), position);
                    inner.transfer_slot(
                        &cmd.exposure_key(),
                        &SlotHolder::Command(cmd.token.clone()),
                        SlotHolder::Position(broker_id),
                    );
                    if let Some(signal) = cmd
                        .signal_id
                        .as_ref()
                        .and_then(|id| inner.signals.get_mut(id))
                    {
                        signal.status = SignalStatus::Executed;
                    }
                }
                CommandType::Modify => {
                    if let Some(position) = cmd
                        .payload
                        .target_broker_id
                        .as_ref()
                        .and_then(|id| inner.positions.get_mut(id))
                    {
                        if cmd.payload.stop_loss.is_some() {
                            position.stop_loss = cmd.payload.stop_loss;
                        }
                        if cmd.payload.take_profit.is_some() {
                            position.take_profit = cmd.payload.take_profit;
                        }
                    }
                }
                CommandType::Close => {}
            }
        }
        Ok(Some(cmd))
    }

    async fn unsettled_closed_positions(&self) -> StoreResult<Vec<Position>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Closed && !p.pnl_settled)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.closed_at_ms);
        Ok(positions)
    }

    async fn settle_position_pnl(&self, broker_id: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        match inner.positions.get_mut(broker_id) {
            Some(p) if p.status == PositionStatus::Closed && !p.pnl_settled => {
                p.pnl_settled = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("position {broker_id}"))),
        }
    }

    async fn open_positions(&self, account: &AccountId) -> StoreResult<Vec<Position>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| &p.account == account && p.is_open())
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at_ms);
        Ok(positions)
    }

    async fn get_position(&self, broker_id: &str) -> StoreResult<Option<Position>> {
        self.ensure_available()?;
        Ok(self.inner.lock().positions.get(broker_id).cloned())
    }

    async fn load_risk_state(
        &self,
        account: &AccountId,
        today: NaiveDate,
    ) -> StoreResult<RiskState> {
        self.ensure_available()?;
        Ok(self
            .inner
            .lock()
            .risk
            .get(account)
            .cloned()
            .unwrap_or_else(|| RiskState::new(account.clone(), today)))
    }

    async fn save_risk_state(&self, state: &RiskState) -> StoreResult<RiskState> {
        self.ensure_available()?;
        if self
            .failing_risk_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("risk state write failed".to_string()));
        }
        let mut inner = self.inner.lock();
        let current = inner.risk.get(&state.account).map_or(0, |s| s.version);
        if current != state.version {
            return Err(StoreError::VersionConflict {
                account: state.account.to_string(),
                expected: state.version,
            });
        }
        let mut stored = state.clone();
        stored.version += 1;
        inner.risk.insert(stored.account.clone(), stored.clone());
        Ok(stored)
    }
}
