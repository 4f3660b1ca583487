//! Command reconciliation.
//!
//! A periodic sweep over durable command state:
//! 1. fail `pending`/`processing` commands that outlived the timeout
//! 2. consume terminal command outcomes into the circuit breaker
//! 3. consume closed positions' realized P&L into the daily drawdown
//!
//! Each step is a conditional transition in the store, so concurrent
//! reconcilers (or a restart mid-sweep) never double-count an outcome.
//! Breaker updates that fail after a transition are kept and replayed at
//! the start of the next sweep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tradegate_core::{AccountId, AuditEvent, Command, CommandFailure, CommandStatus, Money};
use tradegate_risk::BreakerEvent;
use tradegate_telemetry::Metrics;

use crate::context::{ExecutionContext, PROCESS_ACCOUNT};
use crate::error::ExecutorResult;

/// Reconciler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Commands older than this in `pending`/`processing` are failed. Default: 60.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Sweep interval (ms). Default: 1,000.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_interval_ms() -> u64 {
    1_000
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl ReconcilerConfig {
    pub fn command_timeout_ms(&self) -> u64 {
        self.command_timeout_secs * 1000
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub completed: usize,
    pub failed: usize,
    pub positions_closed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    ctx: Arc<ExecutionContext>,
    /// Outcomes already claimed in the store whose breaker update failed.
    deferred: Mutex<Vec<(AccountId, BreakerEvent)>>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, ctx: Arc<ExecutionContext>) -> Self {
        Self {
            config,
            ctx,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one full reconciliation pass.
    pub async fn sweep(&self) -> ExecutorResult<SweepReport> {
        let mut report = SweepReport::default();
        self.replay_deferred().await?;
        self.expire_stale(&mut report).await?;
        self.settle_commands(&mut report).await?;
        self.settle_positions(&mut report).await?;
        if !report.is_empty() {
            debug!(?report, "Reconciler sweep");
        }
        Ok(report)
    }

    /// Number of breaker updates waiting for the next sweep.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Re-apply deferred breaker updates in their original order. Stops at
    /// the first failure and keeps the rest queued.
    async fn replay_deferred(&self) -> ExecutorResult<()> {
        let queued = std::mem::take(&mut *self.deferred.lock());
        let mut queued = queued.into_iter();
        while let Some((account, event)) = queued.next() {
            if let Err(e) = self.ctx.breaker.record(&account, event.clone()).await {
                let mut deferred = self.deferred.lock();
                let newer = std::mem::take(&mut *deferred);
                deferred.push((account, event));
                deferred.extend(queued);
                deferred.extend(newer);
                return Err(e.into());
            }
            info!(account = %account, ?event, "Deferred breaker update applied");
        }
        Ok(())
    }

    /// Feed an outcome the store already marked settled. On failure the
    /// event is queued for the next sweep instead of being lost.
    async fn record_outcome(&self, account: &AccountId, event: BreakerEvent) -> ExecutorResult<()> {
        if let Err(e) = self.ctx.breaker.record(account, event.clone()).await {
            warn!(account = %account, ?event, error = %e, "Breaker update failed; deferring");
            self.deferred.lock().push((account.clone(), event));
            return Err(e.into());
        }
        Ok(())
    }

    async fn expire_stale(&self, report: &mut SweepReport) -> ExecutorResult<()> {
        let now = self.ctx.now_ms();
        let timeout_ms = self.config.command_timeout_ms();

        for status in [CommandStatus::Pending, CommandStatus::Processing] {
            for cmd in self.ctx.store.commands_with_status(status).await? {
                let age_ms = cmd.age_ms(now);
                if age_ms < timeout_ms {
                    continue;
                }
                // Only the caller that performs the transition reports it.
                if !self.ctx.store.expire_command(&cmd.token, now).await? {
                    continue;
                }
                report.timed_out += 1;
                warn!(
                    account = %cmd.account,
                    token = %cmd.token,
                    command_type = %cmd.command_type,
                    status = %status,
                    age_ms,
                    "Command timed out"
                );
                Metrics::command_timeout(cmd.command_type.as_str());
                self.ctx.emit(
                    &cmd.account,
                    AuditEvent::CommandTimeout {
                        token: cmd.token.clone(),
                        command_type: cmd.command_type,
                        age_ms,
                    },
                );
            }
        }
        Ok(())
    }

    async fn settle_commands(&self, report: &mut SweepReport) -> ExecutorResult<()> {
        for cmd in self.ctx.store.unsettled_commands().await? {
            let Some(settled) = self.ctx.store.settle_command(&cmd.token, self.ctx.now_ms()).await?
            else {
                continue;
            };

            let event = match Self::outcome(&settled) {
                Some(Ok(())) => {
                    report.completed += 1;
                    info!(
                        account = %settled.account,
                        token = %settled.token,
                        command_type = %settled.command_type,
                        broker_id = ?settled.broker_id,
                        "Command completed"
                    );
                    Some(BreakerEvent::CommandCompleted)
                }
                Some(Err(failure)) => {
                    report.failed += 1;
                    warn!(
                        account = %settled.account,
                        token = %settled.token,
                        command_type = %settled.command_type,
                        failure = %failure,
                        "Command failed"
                    );
                    Some(BreakerEvent::CommandFailed {
                        kind: failure.kind(),
                    })
                }
                None => None,
            };

            Metrics::command_settled(settled.command_type.as_str(), settled.status.as_str());
            self.ctx.emit(
                &settled.account,
                AuditEvent::CommandSettled {
                    token: settled.token.clone(),
                    command_type: settled.command_type,
                    status: settled.status,
                    failure_reason: settled.failure_reason.clone(),
                    broker_id: settled.broker_id.clone(),
                },
            );

            if let Some(event) = event {
                self.record_outcome(&settled.account, event).await?;
            }
        }
        Ok(())
    }

    /// `Ok` for completion, the failure otherwise; `None` while in flight.
    /// Operator cancels are stored already settled and never get here.
    fn outcome(cmd: &Command) -> Option<Result<(), CommandFailure>> {
        match cmd.status {
            CommandStatus::Completed => Some(Ok(())),
            CommandStatus::Failed if cmd.is_timed_out() => Some(Err(CommandFailure::Timeout)),
            CommandStatus::Failed => Some(Err(CommandFailure::RejectedByGateway {
                reason: cmd.failure_reason.clone().unwrap_or_default(),
            })),
            CommandStatus::Pending | CommandStatus::Processing => None,
        }
    }

    async fn settle_positions(&self, report: &mut SweepReport) -> ExecutorResult<()> {
        for position in self.ctx.store.unsettled_closed_positions().await? {
            if !self.ctx.store.settle_position_pnl(&position.broker_id).await? {
                continue;
            }
            report.positions_closed += 1;
            let pnl = position.realized_pnl.unwrap_or(Money::ZERO);
            info!(
                account = %position.account,
                broker_id = %position.broker_id,
                instrument = %position.instrument,
                pnl = %pnl,
                "Position P&L settled"
            );
            self.record_outcome(&position.account, BreakerEvent::PositionClosed { pnl })
                .await?;
        }
        Ok(())
    }

    /// Sweep every `interval_ms` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            timeout_secs = self.config.command_timeout_secs,
            interval_ms = self.config.interval_ms,
            "Reconciler started"
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        if e.is_fatal() {
                            self.ctx.fail_closed(&PROCESS_ACCOUNT.into(), "reconcile", &e);
                        } else {
                            error!(error = %e, "Reconciler sweep failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::paper::{PaperConfig, PaperGateway, PaperPolicy};
    use crate::testkit::{harness, signal, Harness};
    use tradegate_store::Store;
    use rust_decimal_macros::dec;
    use tradegate_core::{Clock, ExposureKey, RejectReason, Signal, Timeframe};

    fn reconciler(h: &Harness) -> Reconciler {
        Reconciler::new(ReconcilerConfig::default(), h.ctx.clone())
    }

    fn gateway(h: &Harness, policy: PaperPolicy) -> PaperGateway {
        PaperGateway::new(
            PaperConfig {
                policy,
                ..PaperConfig::default()
            },
            h.store.clone(),
            h.clock.clone(),
        )
    }

    fn fresh_signal(h: &Harness, id: &str) -> Signal {
        let mut sig = signal(id, dec!(1.0960));
        sig.created_at_ms = h.clock.now_ms() - 1_000;
        sig
    }

    fn key() -> ExposureKey {
        ExposureKey::new("acc".into(), "EURUSD".into(), Timeframe::H1)
    }

    #[tokio::test]
    async fn test_timeout_counts_exactly_once() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let r = reconciler(&h);
        assert!(d.on_signal(&fresh_signal(&h, "sig-1")).await.is_admitted());

        h.clock.advance_secs(59);
        assert!(r.sweep().await.unwrap().is_empty());

        h.clock.advance_secs(1);
        let report = r.sweep().await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(h.store.committed_count(&key()).await.unwrap(), 0);

        assert!(r.sweep().await.unwrap().is_empty());
        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(h.audit.count("command_timeout"), 1);
    }

    #[tokio::test]
    async fn test_processing_command_also_times_out() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        assert!(d.on_signal(&fresh_signal(&h, "sig-1")).await.is_admitted());
        gateway(&h, PaperPolicy::AcknowledgeOnly)
            .poll_once()
            .await
            .unwrap();

        h.clock.advance_secs(60);
        let report = reconciler(&h).sweep().await.unwrap();
        assert_eq!(report.timed_out, 1);
        let commands = h.store.all_commands();
        assert!(commands[0].is_timed_out());
    }

    #[tokio::test]
    async fn test_completion_creates_position_and_keeps_slot() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let decision = d.on_signal(&fresh_signal(&h, "sig-1")).await;
        gateway(&h, PaperPolicy::Fill).poll_once().await.unwrap();

        let report = reconciler(&h).sweep().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.store.committed_count(&key()).await.unwrap(), 1);
        let positions = h.store.open_positions(&h.account()).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(
            positions[0].broker_id,
            PaperGateway::broker_id_for(decision.token().unwrap())
        );
    }

    #[tokio::test]
    async fn test_consecutive_rejections_trip_then_cooldown_resets() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let r = reconciler(&h);
        let rejecting = gateway(
            &h,
            PaperPolicy::Reject {
                reason: "insufficient margin".into(),
            },
        );

        for i in 0..5 {
            let decision = d.on_signal(&fresh_signal(&h, &format!("sig-{i}"))).await;
            assert!(decision.is_admitted(), "signal {i}: {decision:?}");
            rejecting.poll_once().await.unwrap();
        }
        let report = r.sweep().await.unwrap();
        assert_eq!(report.failed, 5);

        let sixth = d.on_signal(&fresh_signal(&h, "sig-5")).await;
        assert_eq!(sixth.reject_reason(), Some(RejectReason::CircuitBreakerOpen));

        h.clock.advance_secs(300);
        let seventh = d.on_signal(&fresh_signal(&h, "sig-6")).await;
        assert!(seventh.is_admitted());
        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert!(!state.tripped);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(h.audit.count("breaker_transition"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_command_never_reaches_breaker() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let decision = d.on_signal(&fresh_signal(&h, "sig-1")).await;
        d.cancel(decision.token().unwrap()).await.unwrap();

        h.clock.advance_secs(120);
        assert!(reconciler(&h).sweep().await.unwrap().is_empty());
        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_closed_position_pnl_settles_once() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let r = reconciler(&h);
        let decision = d.on_signal(&fresh_signal(&h, "sig-1")).await;
        let broker_id = PaperGateway::broker_id_for(decision.token().unwrap());
        gateway(&h, PaperPolicy::Fill).poll_once().await.unwrap();
        r.sweep().await.unwrap();

        h.store
            .close_position(&broker_id, Money::new(dec!(-3)), "stop_loss", h.clock.now_ms())
            .await
            .unwrap();
        assert_eq!(r.sweep().await.unwrap().positions_closed, 1);
        assert_eq!(r.sweep().await.unwrap().positions_closed, 0);

        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.daily_pnl, Money::new(dec!(-3)));
        assert_eq!(h.store.committed_count(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gateway_reject_with_reserved_reason_still_counts() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let r = reconciler(&h);

        for (i, reason) in ["cancelled", "timeout"].into_iter().enumerate() {
            let decision = d.on_signal(&fresh_signal(&h, &format!("sig-{i}"))).await;
            let token = decision.token().unwrap().clone();
            assert!(h.store.acknowledge_command(&token, h.clock.now_ms()).await.unwrap());
            assert!(h
                .store
                .reject_command(&token, reason, h.clock.now_ms())
                .await
                .unwrap());

            let stored = h.store.get_command(&token).await.unwrap().unwrap();
            assert!(!stored.is_cancelled());
            assert!(!stored.is_timed_out());
            assert_eq!(r.sweep().await.unwrap().failed, 1);
        }

        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_failed_breaker_update_is_replayed() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let r = reconciler(&h);
        assert!(d.on_signal(&fresh_signal(&h, "sig-1")).await.is_admitted());
        gateway(
            &h,
            PaperPolicy::Reject {
                reason: "no liquidity".into(),
            },
        )
        .poll_once()
        .await
        .unwrap();

        h.store.fail_next_risk_saves(1);
        assert!(r.sweep().await.is_err());
        assert_eq!(r.deferred_len(), 1);
        // Settled in the store, but not yet counted.
        assert!(h.store.unsettled_commands().await.unwrap().is_empty());
        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);

        r.sweep().await.unwrap();
        assert_eq!(r.deferred_len(), 0);
        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.consecutive_failures, 1);

        // Replayed exactly once.
        r.sweep().await.unwrap();
        let state = h.ctx.breaker.state(&h.account()).await.unwrap();
        assert_eq!(state.consecutive_failures, 1);
    }
}
