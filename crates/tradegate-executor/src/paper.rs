//! Simulated execution gateway for dry runs and tests.
//!
//! Polls `pending` commands and drives them through the same store
//! transitions a real gateway would use.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tradegate_core::{Clock, Command, CommandStatus, CommandToken, CommandType, Money};
use tradegate_store::{Store, StoreError};

use crate::error::ExecutorResult;

/// How the paper gateway answers commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PaperPolicy {
    /// Acknowledge and fill at the reference price.
    #[default]
    Fill,
    /// Acknowledge, then reject with `reason`.
    Reject { reason: String },
    /// Acknowledge and never finish.
    AcknowledgeOnly,
    /// Never touch anything.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default)]
    pub policy: PaperPolicy,
    /// Poll interval (ms). Default: 500.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            policy: PaperPolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Commands handled in one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub acknowledged: usize,
    pub filled: usize,
    pub rejected: usize,
}

pub struct PaperGateway {
    config: PaperConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl PaperGateway {
    pub fn new(config: PaperConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn policy(&self) -> &PaperPolicy {
        &self.config.policy
    }

    /// Broker id for a fill of `token`. Tokens never repeat, so ids stay
    /// unique across gateway restarts sharing one store.
    pub fn broker_id_for(token: &CommandToken) -> String {
        format!("PAPER-{token}")
    }

    /// Handle every `pending` command once.
    pub async fn poll_once(&self) -> ExecutorResult<PollReport> {
        let mut report = PollReport::default();
        if self.config.policy == PaperPolicy::Silent {
            return Ok(report);
        }

        for cmd in self.store.commands_with_status(CommandStatus::Pending).await? {
            let now = self.clock.now_ms();
            // Lost the race against a cancel or a timeout.
            if !self.store.acknowledge_command(&cmd.token, now).await? {
                continue;
            }
            report.acknowledged += 1;

            match &self.config.policy {
                PaperPolicy::Fill => {
                    if self.fill(&cmd, now).await? {
                        report.filled += 1;
                    }
                }
                PaperPolicy::Reject { reason } => {
                    if self.store.reject_command(&cmd.token, reason, now).await? {
                        report.rejected += 1;
                        debug!(token = %cmd.token, reason = %reason, "Paper rejected command");
                    }
                }
                PaperPolicy::AcknowledgeOnly | PaperPolicy::Silent => {}
            }
        }
        Ok(report)
    }

    async fn fill(&self, cmd: &Command, now: u64) -> ExecutorResult<bool> {
        let broker_id = match (cmd.command_type, &cmd.payload.target_broker_id) {
            (CommandType::Open, _) => Self::broker_id_for(&cmd.token),
            (_, Some(target)) => target.clone(),
            (_, None) => Self::broker_id_for(&cmd.token),
        };
        let filled = self
            .store
            .complete_command(&cmd.token, &broker_id, cmd.payload.entry_price, now)
            .await?;
        if !filled {
            return Ok(false);
        }
        info!(
            account = %cmd.account,
            token = %cmd.token,
            command_type = %cmd.command_type,
            broker_id = %broker_id,
            "Paper filled command"
        );

        if cmd.command_type == CommandType::Close {
            // No market data here, so paper closes realize nothing.
            match self
                .store
                .close_position(&broker_id, Money::ZERO, "paper_close", now)
                .await
            {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {
                    warn!(broker_id = %broker_id, "Paper close for unknown position");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Poll every `poll_interval_ms` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(policy = ?self.config.policy, "Paper gateway started");
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Paper gateway stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Paper gateway poll failed");
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
    use crate::reconciler::{Reconciler, ReconcilerConfig};
    use crate::testkit::{harness, signal, Harness};
    use rust_decimal_macros::dec;

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

    #[tokio::test]
    async fn test_silent_policy_leaves_commands_pending() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        assert!(d.on_signal(&signal("sig-1", dec!(1.0960))).await.is_admitted());

        let report = gateway(&h, PaperPolicy::Silent).poll_once().await.unwrap();
        assert_eq!(report, PollReport::default());
        assert_eq!(h.store.all_commands()[0].status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn test_reject_policy_fails_command() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        assert!(d.on_signal(&signal("sig-1", dec!(1.0960))).await.is_admitted());

        let report = gateway(
            &h,
            PaperPolicy::Reject {
                reason: "market closed".into(),
            },
        )
        .poll_once()
        .await
        .unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.rejected, 1);

        let commands = h.store.all_commands();
        assert_eq!(commands[0].status, CommandStatus::Failed);
        assert_eq!(commands[0].failure_reason.as_deref(), Some("market closed"));
    }

    #[tokio::test]
    async fn test_close_fill_closes_position() {
        let h = harness().await;
        let d = Dispatcher::new(h.account(), h.ctx.clone());
        let paper = gateway(&h, PaperPolicy::Fill);
        let reconciler = Reconciler::new(ReconcilerConfig::default(), h.ctx.clone());

        let decision = d.on_signal(&signal("sig-1", dec!(1.0960))).await;
        let broker_id = PaperGateway::broker_id_for(decision.token().unwrap());
        assert_eq!(paper.poll_once().await.unwrap().filled, 1);
        reconciler.sweep().await.unwrap();

        d.dispatch_close(&broker_id).await.unwrap();
        assert_eq!(paper.poll_once().await.unwrap().filled, 1);

        let position = h.store.get_position(&broker_id).await.unwrap().unwrap();
        assert!(!position.is_open());
        assert_eq!(position.realized_pnl, Some(Money::ZERO));
        assert!(h.store.open_positions(&h.account()).await.unwrap().is_empty());
    }
}
