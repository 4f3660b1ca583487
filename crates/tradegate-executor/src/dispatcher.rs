//! Admission pipeline and command dispatch for one account.
//!
//! # Gate order (strict)
//!
//! 1. Fail-closed latch        -> Rejected(StorageUnavailable)
//! 2. Intake filters           -> Rejected(Inactive | UnknownInstrument |
//!                                InstrumentPaused | FutureTimestamp | Stale |
//!                                BelowConfidence)
//! 3. Dedup claim              -> Rejected(Duplicate)
//! 4. Early exposure check     -> Rejected(ExposureLimitReached)
//! 5. Balance lookup + sizing
//! 6. Stop-loss enforcement    -> Rejected(InvalidStopLoss | RiskLimitExceeded)
//! 7. Circuit breaker          -> Rejected(CircuitBreakerOpen)
//! 8. Per-key lock, final exposure check, transactional create
//!                             -> Admitted | Rejected(ExposureLimitReached | Duplicate)
//!
//! Every decision is audited before `on_signal` returns.

use std::fmt::Display;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tradegate_core::{
    AccountId, AdmissionDecision, AuditEvent, Command, CommandPayload, CommandToken, CommandType,
    ExposureKey, Position, Price, RejectReason, Signal,
};
use tradegate_intake::{fingerprint, DedupCache};
use tradegate_risk::StopLossVerdict;
use tradegate_store::StoreError;
use tradegate_telemetry::Metrics;

use crate::context::ExecutionContext;
use crate::error::{ExecutorError, ExecutorResult};

pub struct Dispatcher {
    account: AccountId,
    ctx: Arc<ExecutionContext>,
    dedup: DedupCache,
}

impl Dispatcher {
    pub fn new(account: AccountId, ctx: Arc<ExecutionContext>) -> Self {
        let window_ms = ctx.intake.config().dedup_window_ms();
        Self {
            account,
            ctx,
            dedup: DedupCache::new(window_ms),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    // ========================================================================
    // OPEN admission
    // ========================================================================

    /// Evaluate one signal and, if admitted, persist a `pending` OPEN command.
    pub async fn on_signal(&self, signal: &Signal) -> AdmissionDecision {
        let now_ms = self.ctx.now_ms();
        let mut claimed = None;
        let decision = self.admit(signal, now_ms, &mut claimed).await;

        if let (Some(reason), Some(fp)) = (decision.reject_reason(), claimed.as_deref()) {
            if reason.is_transient() {
                self.dedup.release(fp);
            }
        }

        self.record_decision(signal, claimed, &decision);
        decision
    }

    async fn admit(
        &self,
        signal: &Signal,
        now_ms: u64,
        claimed: &mut Option<String>,
    ) -> AdmissionDecision {
        // Gate 1: fail-closed latch
        if self.ctx.latch.is_triggered() {
            debug!(signal_id = %signal.id, "Signal rejected: fail-closed");
            return AdmissionDecision::rejected(RejectReason::StorageUnavailable);
        }

        // Gate 2: intake filters
        let entry = match self.ctx.intake.screen(signal, now_ms) {
            Ok(entry) => entry,
            Err(reason) => {
                debug!(signal_id = %signal.id, reason = %reason, "Signal rejected by intake");
                return AdmissionDecision::rejected(reason);
            }
        };

        // Gate 3: dedup claim
        let fp = fingerprint(signal, &entry.spec);
        if !self.dedup.try_claim(&fp, now_ms) {
            debug!(signal_id = %signal.id, fingerprint = %fp, "Signal rejected: duplicate");
            return AdmissionDecision::rejected(RejectReason::Duplicate);
        }
        *claimed = Some(fp.clone());

        let key = ExposureKey::new(
            self.account.clone(),
            signal.instrument.clone(),
            signal.timeframe,
        );
        let max_positions = entry.risk.max_positions;

        // Gate 4: early exposure check
        match self.ctx.exposure.admit(&key, max_positions).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Signal rejected: exposure limit");
                return AdmissionDecision::rejected(RejectReason::ExposureLimitReached);
            }
            Err(e) => return self.storage_failure("committed_count", e.is_fatal(), &e),
        }

        // Step 5: balance and sizing
        let balance = match self.ctx.store.account_balance(&self.account).await {
            Ok(balance) => balance,
            Err(StoreError::NotFound(_)) => {
                warn!(account = %self.account, "No balance on record, refusing to size");
                return AdmissionDecision::rejected(RejectReason::RiskLimitExceeded);
            }
            Err(e) => return self.storage_failure("account_balance", e.is_fatal(), &e),
        };
        let stop_loss = signal.effective_stop_loss();
        let stop_distance = signal.stop_distance().unwrap_or_default();
        let sized = self.ctx.sizer.size(
            balance,
            signal.confidence,
            &entry.risk,
            &entry.spec,
            stop_distance,
        );

        // Gate 6: stop-loss and loss cap
        let (volume, original_volume, potential_loss) = match self.ctx.enforcer.validate(
            signal.entry_price,
            stop_loss,
            signal.direction,
            sized,
            &entry.risk,
            &entry.spec,
        ) {
            StopLossVerdict::Accept {
                volume,
                potential_loss,
            } => (volume, None, potential_loss),
            StopLossVerdict::Adjust {
                original,
                volume,
                potential_loss,
            } => {
                info!(
                    signal_id = %signal.id,
                    instrument = %signal.instrument,
                    original_volume = %original,
                    volume = %volume,
                    potential_loss = %potential_loss,
                    cap = %entry.risk.max_loss_per_trade,
                    "Volume reduced to fit loss cap"
                );
                Metrics::volume_shrunk(signal.instrument.as_str());
                (volume, Some(original), potential_loss)
            }
            StopLossVerdict::Reject { reason } => {
                debug!(signal_id = %signal.id, reason = %reason, "Signal rejected by stop-loss enforcer");
                return AdmissionDecision::rejected(reason);
            }
        };

        // Gate 7: circuit breaker
        match self.ctx.breaker.check(&self.account).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(account = %self.account, "Signal rejected: circuit breaker open");
                return AdmissionDecision::rejected(RejectReason::CircuitBreakerOpen);
            }
            Err(e) if e.is_fatal() => return self.storage_failure("risk_state", true, &e),
            Err(e) => {
                // Contended risk state: breaker status unknown, stay shut this round.
                warn!(account = %self.account, error = %e, "Breaker check failed");
                return AdmissionDecision::rejected(RejectReason::CircuitBreakerOpen);
            }
        }

        // Gate 8: per-key lock, final check, transactional create
        let _guard = self.ctx.exposure.lock(&key).await;
        match self.ctx.exposure.admit(&key, max_positions).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Signal rejected: exposure limit (final check)");
                return AdmissionDecision::rejected(RejectReason::ExposureLimitReached);
            }
            Err(e) => return self.storage_failure("committed_count", e.is_fatal(), &e),
        }

        let command = Command::open(
            self.account.clone(),
            CommandPayload {
                instrument: signal.instrument.clone(),
                timeframe: signal.timeframe,
                direction: signal.direction,
                volume,
                entry_price: Some(signal.entry_price),
                stop_loss,
                take_profit: signal.take_profit,
                target_broker_id: None,
            },
            signal.id.clone(),
            fp,
            now_ms,
        );

        match self
            .ctx
            .store
            .create_open_command(&command, max_positions)
            .await
        {
            Ok(()) => {
                Metrics::command_dispatched(CommandType::Open.as_str());
                info!(
                    account = %self.account,
                    signal_id = %signal.id,
                    instrument = %signal.instrument,
                    timeframe = %signal.timeframe,
                    direction = %signal.direction,
                    volume = %volume,
                    potential_loss = %potential_loss,
                    token = %command.token,
                    "Signal admitted"
                );
                AdmissionDecision::Admitted {
                    token: command.token,
                    volume,
                    original_volume,
                    potential_loss,
                }
            }
            Err(StoreError::ExposureConflict { key }) => {
                debug!(key = %key, "Signal rejected: exposure slot taken");
                AdmissionDecision::rejected(RejectReason::ExposureLimitReached)
            }
            Err(StoreError::DuplicateFingerprint(_)) => {
                debug!(signal_id = %signal.id, "Signal rejected: already dispatched");
                AdmissionDecision::rejected(RejectReason::Duplicate)
            }
            Err(e) => self.storage_failure("create_open_command", e.is_fatal(), &e),
        }
    }

    fn storage_failure(&self, op: &str, fatal: bool, error: &dyn Display) -> AdmissionDecision {
        if fatal {
            self.ctx.fail_closed(&self.account, op, error);
        } else {
            Metrics::store_error(op);
            warn!(account = %self.account, op, error = %error, "Unexpected store error during admission");
        }
        AdmissionDecision::rejected(RejectReason::StorageUnavailable)
    }

    fn record_decision(
        &self,
        signal: &Signal,
        fingerprint: Option<String>,
        decision: &AdmissionDecision,
    ) {
        Metrics::admission(decision.reject_reason().map(|r| r.as_str()));

        let event = match decision {
            AdmissionDecision::Admitted {
                token,
                volume,
                original_volume,
                potential_loss,
            } => AuditEvent::Admission {
                signal_id: signal.id.clone(),
                instrument: signal.instrument.clone(),
                timeframe: signal.timeframe,
                fingerprint,
                admitted: true,
                reason: None,
                token: Some(token.clone()),
                volume: Some(*volume),
                original_volume: *original_volume,
                potential_loss: Some(*potential_loss),
            },
            AdmissionDecision::Rejected { reason } => AuditEvent::Admission {
                signal_id: signal.id.clone(),
                instrument: signal.instrument.clone(),
                timeframe: signal.timeframe,
                fingerprint,
                admitted: false,
                reason: Some(*reason),
                token: None,
                volume: None,
                original_volume: None,
                potential_loss: None,
            },
        };
        self.ctx.emit(&self.account, event);
    }

    /// Evict dedup entries older than the window.
    pub fn sweep_dedup(&self, now_ms: u64) -> usize {
        let evicted = self.dedup.sweep(now_ms);
        Metrics::dedup_cache_size(self.account.as_str(), self.dedup.len());
        evicted
    }

    // ========================================================================
    // MODIFY / CLOSE
    // ========================================================================

    /// Persist a MODIFY command for an open position.
    ///
    /// MODIFY does not add exposure, so it bypasses exposure, sizing and the
    /// breaker; a new stop-loss must still pass the enforcer.
    pub async fn dispatch_modify(
        &self,
        broker_id: &str,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> ExecutorResult<CommandToken> {
        if stop_loss.is_none() && take_profit.is_none() {
            return Err(ExecutorError::InvalidRequest(
                "modify needs a stop-loss or a take-profit".into(),
            ));
        }
        let position = self.open_position(broker_id).await?;
        let entry = self
            .ctx
            .intake
            .book()
            .get(&position.instrument)
            .ok_or_else(|| ExecutorError::UnknownInstrument(position.instrument.to_string()))?;

        if let Some(sl) = stop_loss {
            self.ctx
                .enforcer
                .validate_modify(&position, sl, &entry.risk, &entry.spec)
                .map_err(ExecutorError::Rejected)?;
        }

        let payload = CommandPayload {
            instrument: position.instrument.clone(),
            timeframe: position.timeframe,
            direction: position.direction,
            volume: position.volume,
            entry_price: None,
            stop_loss,
            take_profit,
            target_broker_id: Some(position.broker_id.clone()),
        };
        self.insert_position_command(CommandType::Modify, payload)
            .await
    }

    /// Persist a CLOSE command for an open position.
    pub async fn dispatch_close(&self, broker_id: &str) -> ExecutorResult<CommandToken> {
        let position = self.open_position(broker_id).await?;
        let payload = CommandPayload {
            instrument: position.instrument.clone(),
            timeframe: position.timeframe,
            direction: position.direction,
            volume: position.volume,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            target_broker_id: Some(position.broker_id.clone()),
        };
        self.insert_position_command(CommandType::Close, payload)
            .await
    }

    async fn open_position(&self, broker_id: &str) -> ExecutorResult<Position> {
        if self.ctx.latch.is_triggered() {
            return Err(ExecutorError::FailClosed(
                self.ctx.latch.reason().unwrap_or_default(),
            ));
        }
        let position = self
            .ctx
            .store
            .get_position(broker_id)
            .await
            .map_err(|e| self.observe_store_error("get_position", e))?;
        match position {
            Some(p) if p.is_open() && p.account == self.account => Ok(p),
            _ => Err(ExecutorError::NotFound(format!(
                "open position {broker_id} for {}",
                self.account
            ))),
        }
    }

    async fn insert_position_command(
        &self,
        command_type: CommandType,
        payload: CommandPayload,
    ) -> ExecutorResult<CommandToken> {
        let command =
            Command::for_position(self.account.clone(), command_type, payload, self.ctx.now_ms());
        self.ctx
            .store
            .insert_command(&command)
            .await
            .map_err(|e| self.observe_store_error("insert_command", e))?;

        Metrics::command_dispatched(command_type.as_str());
        info!(
            account = %self.account,
            token = %command.token,
            command_type = %command_type,
            target = ?command.payload.target_broker_id,
            "Command dispatched"
        );
        self.ctx.emit(
            &self.account,
            AuditEvent::CommandDispatched {
                token: command.token.clone(),
                command_type,
                target_broker_id: command.payload.target_broker_id.clone(),
            },
        );
        Ok(command.token)
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a `pending` command of this account.
    ///
    /// Returns `false` if the gateway already acknowledged (or finished) it.
    pub async fn cancel(&self, token: &CommandToken) -> ExecutorResult<bool> {
        let command = self
            .ctx
            .store
            .get_command(token)
            .await
            .map_err(|e| self.observe_store_error("get_command", e))?;
        match command {
            Some(c) if c.account == self.account => {}
            _ => return Err(ExecutorError::NotFound(format!("command {token}"))),
        }

        let cancelled = self
            .ctx
            .store
            .cancel_command(token, self.ctx.now_ms())
            .await
            .map_err(|e| self.observe_store_error("cancel_command", e))?;
        if cancelled {
            info!(account = %self.account, token = %token, "Command cancelled");
            self.ctx.emit(
                &self.account,
                AuditEvent::CommandCancelled {
                    token: token.clone(),
                },
            );
        } else {
            debug!(token = %token, "Command no longer pending, not cancelled");
        }
        Ok(cancelled)
    }

    fn observe_store_error(&self, op: &str, e: StoreError) -> ExecutorError {
        if e.is_fatal() {
            self.ctx.fail_closed(&self.account, op, &e);
        }
        e.into()
    }
}
