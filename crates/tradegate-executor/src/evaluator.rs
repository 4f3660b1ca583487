//! Periodic evaluation loop for one account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use tradegate_core::{AccountId, Instrument, Signal};
use tradegate_telemetry::Metrics;

use crate::dispatcher::Dispatcher;
use crate::error::ExecutorResult;

/// Evaluator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Tick interval (ms). Default: 1,000.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Restrict evaluation to these instruments. `None` evaluates every
    /// active signal.
    #[serde(default)]
    pub instruments: Option<Vec<Instrument>>,
}

fn default_interval_ms() -> u64 {
    1_000
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            instruments: None,
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub evaluated: usize,
    pub admitted: usize,
    pub rejected: usize,
    /// Active signals already decided for good in an earlier tick.
    pub skipped: usize,
}

pub struct Evaluator {
    config: EvaluatorConfig,
    dispatcher: Arc<Dispatcher>,
    /// Signal versions that were admitted or finally rejected, by id.
    decided: Mutex<HashMap<String, Signal>>,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            decided: Mutex::new(HashMap::new()),
        }
    }

    pub fn account(&self) -> &AccountId {
        self.dispatcher.account()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Evaluate every active signal once.
    ///
    /// While the controller is fail-closed the tick first probes the store;
    /// if it is still unhealthy nothing is evaluated. A signal version that
    /// was admitted or finally rejected is not presented again until the
    /// stored signal changes.
    pub async fn tick(&self) -> ExecutorResult<TickSummary> {
        let ctx = self.dispatcher.context();
        let account = self.dispatcher.account();
        let mut summary = TickSummary::default();

        if !ctx.recover(account).await {
            return Ok(summary);
        }

        let started = Instant::now();
        let signals = match ctx
            .store
            .active_signals(self.config.instruments.as_deref())
            .await
        {
            Ok(signals) => signals,
            Err(e) => {
                if e.is_fatal() {
                    ctx.fail_closed(account, "active_signals", &e);
                }
                return Err(e.into());
            }
        };

        let pending: Vec<&Signal> = {
            let mut decided = self.decided.lock();
            let current: HashMap<&str, &Signal> =
                signals.iter().map(|s| (s.id.as_str(), s)).collect();
            decided.retain(|id, seen| current.get(id.as_str()).is_some_and(|s| **s == *seen));
            signals
                .iter()
                .filter(|s| !decided.contains_key(&s.id))
                .collect()
        };
        summary.skipped = signals.len() - pending.len();

        for signal in pending {
            let decision = self.dispatcher.on_signal(signal).await;
            summary.evaluated += 1;
            let finished = match decision.reject_reason() {
                None => {
                    summary.admitted += 1;
                    true
                }
                Some(reason) => {
                    summary.rejected += 1;
                    reason.is_final()
                }
            };
            if finished {
                self.decided.lock().insert(signal.id.clone(), signal.clone());
            }
        }

        let evicted = self.dispatcher.sweep_dedup(ctx.now_ms());
        let pruned = ctx.exposure.prune();
        trace!(account = %account, evicted, pruned, "Evaluator housekeeping");

        Metrics::evaluation_latency(account.as_str(), started.elapsed().as_secs_f64() * 1000.0);
        if summary.evaluated > 0 {
            debug!(
                account = %account,
                evaluated = summary.evaluated,
                admitted = summary.admitted,
                rejected = summary.rejected,
                "Evaluation tick"
            );
        }
        Ok(summary)
    }

    /// Tick every `interval_ms` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            account = %self.account(),
            interval_ms = self.config.interval_ms,
            instruments = ?self.config.instruments,
            "Evaluator started"
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(account = %self.account(), "Evaluator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(account = %self.account(), error = %e, "Evaluation tick failed");
                    }
                }
            }
        }
    }
}
