//! Application wiring and admin operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tradegate_core::{
    AccountId, AuditSink, Clock, CommandToken, InstrumentBook, RiskState, SystemClock,
};
use tradegate_executor::{Dispatcher, Evaluator, ExecutionContext, PaperGateway, Reconciler};
use tradegate_persistence::{read_signals, FanoutAuditSink, JsonLinesAuditSink, TracingAuditSink};
use tradegate_store::{MemoryStore, SqliteStore, Store, StoreError};
use tradegate_telemetry::Metrics;

use crate::config::AppConfig;
use crate::error::AppResult;

/// How long `run` waits for workers after shutdown before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One controller process.
pub struct Application {
    config: AppConfig,
    ctx: Arc<ExecutionContext>,
}

impl Application {
    /// Open the store, seed balances of new accounts and build the audit sinks.
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let store: Arc<dyn Store> = if config.store.is_memory() {
            warn!("Using in-process store; state is lost on exit");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(SqliteStore::connect(&config.store.url, config.store.max_connections).await?)
        };

        let mut sinks: Vec<Arc<dyn AuditSink>> =
            vec![Arc::new(JsonLinesAuditSink::new(&config.audit.dir)?)];
        if config.audit.tracing {
            sinks.push(Arc::new(TracingAuditSink));
        }
        let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(sinks));

        Self::with_parts(config, store, Arc::new(SystemClock), audit).await
    }

    /// Build from explicit components.
    pub async fn with_parts(
        config: AppConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> AppResult<Self> {
        for account in &config.accounts {
            let Some(balance) = account.initial_balance else {
                continue;
            };
            // Only a fresh account takes the configured balance.
            match store.account_balance(&account.id).await {
                Ok(current) => {
                    debug!(account = %account.id, balance = %current, "Keeping stored balance");
                }
                Err(StoreError::NotFound(_)) => {
                    store.set_account_balance(&account.id, balance).await?;
                    info!(account = %account.id, balance = %balance, "Seeded account balance");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let book = Arc::new(InstrumentBook::new(config.instruments.iter().cloned()));
        let ctx = Arc::new(ExecutionContext::new(
            store,
            book,
            &config.controller_settings(),
            clock,
            audit,
        ));
        Ok(Self { config, ctx })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Dispatcher for `account`. Each call starts with an empty dedup cache.
    pub fn dispatcher(&self, account: &AccountId) -> Dispatcher {
        Dispatcher::new(account.clone(), self.ctx.clone())
    }

    /// Run evaluators, the reconciler and (optionally) the paper gateway
    /// until ctrl-c or `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        info!(
            accounts = self.config.accounts.len(),
            instruments = self.config.instruments.len(),
            paper = self.config.paper.enabled,
            "Starting controller"
        );

        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();
        for account in &self.config.accounts {
            let evaluator = Evaluator::new(
                self.config.evaluator.clone(),
                Arc::new(self.dispatcher(&account.id)),
            );
            handles.push((
                format!("evaluator:{}", account.id),
                tokio::spawn(evaluator.run(shutdown.child_token())),
            ));
        }

        let reconciler = Reconciler::new(self.config.reconciler.clone(), self.ctx.clone());
        handles.push((
            "reconciler".to_string(),
            tokio::spawn(reconciler.run(shutdown.child_token())),
        ));

        if self.config.paper.enabled {
            let paper = PaperGateway::new(
                self.config.paper.gateway.clone(),
                self.ctx.store.clone(),
                self.ctx.clock.clone(),
            );
            handles.push((
                "paper".to_string(),
                tokio::spawn(paper.run(shutdown.child_token())),
            ));
        }

        if let Some(path) = self.config.metrics.textfile.clone() {
            let interval = Duration::from_secs(self.config.metrics.interval_secs);
            handles.push((
                "metrics".to_string(),
                tokio::spawn(metrics_writer(path.into(), interval, shutdown.child_token())),
            ));
        }

        tokio::select! {
            _ = shutdown.cancelled() => info!("Shutdown requested"),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
                info!("Shutdown signal received");
            }
        }
        shutdown.cancel();

        for (name, handle) in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(joined) => joined?,
                Err(_) => warn!(task = %name, "Task did not stop in time"),
            }
        }
        info!("Controller stopped");
        Ok(())
    }

    /// Current breaker state for `account`.
    pub async fn breaker_status(&self, account: &AccountId) -> AppResult<RiskState> {
        Ok(self.ctx.breaker.state(account).await?)
    }

    /// Clear a tripped breaker regardless of cooldown.
    pub async fn breaker_reset(&self, account: &AccountId) -> AppResult<RiskState> {
        let state = self.ctx.breaker.force_close(account).await?;
        info!(account = %account, "Breaker reset by operator");
        Ok(state)
    }

    /// Trip the breaker until an operator resets it.
    pub async fn breaker_trip(&self, account: &AccountId) -> AppResult<RiskState> {
        let state = self.ctx.breaker.force_trip(account).await?;
        info!(account = %account, "Breaker tripped by operator");
        Ok(state)
    }

    /// Cancel a pending command. Returns `false` if it already left `pending`.
    pub async fn cancel(&self, account: &AccountId, token: &str) -> AppResult<bool> {
        let token = CommandToken::from_string(token.to_string());
        Ok(self.dispatcher(account).cancel(&token).await?)
    }

    /// Load signals from a JSON Lines export into the store.
    pub async fn import_signals(&self, path: &Path) -> AppResult<usize> {
        let signals = read_signals(path)?;
        for signal in &signals {
            if self.ctx.intake.book().get(&signal.instrument).is_none() {
                warn!(
                    signal_id = %signal.id,
                    instrument = %signal.instrument,
                    "Importing signal for unconfigured instrument"
                );
            }
            self.ctx.store.upsert_signal(signal).await?;
        }
        info!(path = %path.display(), count = signals.len(), "Imported signals");
        Ok(signals.len())
    }
}

/// Write the Prometheus text format to `path`, replacing it atomically.
pub fn write_metrics_snapshot(path: &Path) -> AppResult<()> {
    let rendered = Metrics::render()?;
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, rendered)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn metrics_writer(path: PathBuf, interval: Duration, shutdown: CancellationToken) {
    info!(path = %path.display(), "Metrics snapshot writer started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = write_metrics_snapshot(&path) {
                    warn!(error = %e, "Final metrics snapshot failed");
                }
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = write_metrics_snapshot(&path) {
                    warn!(error = %e, path = %path.display(), "Metrics snapshot failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("accounts", &self.config.accounts.len())
            .field("instruments", &self.config.instruments.len())
            .finish()
    }
}
