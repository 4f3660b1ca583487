//! Shared components of one controller process.

use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use tradegate_core::{AccountId, AuditEvent, AuditRecord, AuditSink, Clock, InstrumentBook};
use tradegate_intake::{IntakeConfig, SignalIntake};
use tradegate_risk::{
    BreakerConfig, CircuitBreaker, ExposureTracker, PositionSizer, SizingConfig, StopLossEnforcer,
};
use tradegate_store::Store;
use tradegate_telemetry::Metrics;

use crate::latch::FailClosedLatch;

/// Account used for audit records that concern the whole process.
pub const PROCESS_ACCOUNT: &str = "*";

/// Tunables of the admission pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

/// Everything dispatchers, evaluators and the reconciler share.
///
/// Holds no per-account state of its own: risk state lives in the store,
/// dedup caches live in each [`crate::Dispatcher`].
pub struct ExecutionContext {
    pub store: Arc<dyn Store>,
    pub intake: SignalIntake,
    pub exposure: ExposureTracker,
    pub sizer: PositionSizer,
    pub enforcer: StopLossEnforcer,
    pub breaker: CircuitBreaker,
    pub latch: FailClosedLatch,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
}

impl ExecutionContext {
    pub fn new(
        store: Arc<dyn Store>,
        book: Arc<InstrumentBook>,
        settings: &ControllerSettings,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            intake: SignalIntake::new(settings.intake.clone(), book),
            exposure: ExposureTracker::new(store.clone()),
            sizer: PositionSizer::new(settings.sizing.clone()),
            enforcer: StopLossEnforcer::new(),
            breaker: CircuitBreaker::new(
                store.clone(),
                settings.breaker.clone(),
                clock.clone(),
                audit.clone(),
            ),
            latch: FailClosedLatch::new(),
            store,
            clock,
            audit,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn emit(&self, account: &AccountId, event: AuditEvent) {
        self.audit
            .record(&AuditRecord::new(self.now_ms(), account.clone(), event));
    }

    /// Latch the controller closed after a storage failure in `op`.
    pub fn fail_closed(&self, account: &AccountId, op: &str, error: &dyn Display) {
        Metrics::store_error(op);
        let message = format!("{op}: {error}");
        if self.latch.trigger(&message, self.now_ms()) {
            self.emit(account, AuditEvent::FailClosed { error: message });
        }
    }

    /// Clear the latch if the store answers a health check.
    ///
    /// Returns `true` when admissions may proceed.
    pub async fn recover(&self, account: &AccountId) -> bool {
        if !self.latch.is_triggered() {
            return true;
        }
        match self.store.health_check().await {
            Ok(()) => {
                if self.latch.reset() {
                    self.emit(account, AuditEvent::FailClosedCleared);
                }
                true
            }
            Err(e) => {
                warn!(account = %account, error = %e, "Store still unhealthy, staying fail-closed");
                false
            }
        }
    }
}
