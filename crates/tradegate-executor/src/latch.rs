//! Fail-closed latch.
//!
//! Once a storage failure is observed the latch refuses every admission
//! until an explicit health check succeeds. Process-local; the store's own
//! constraints still protect other processes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{error, info, warn};

use tradegate_telemetry::Metrics;

#[derive(Debug, Default)]
pub struct FailClosedLatch {
    triggered: AtomicBool,
    /// Milliseconds since epoch, 0 if not triggered.
    triggered_at: AtomicU64,
    reason: RwLock<Option<String>>,
}

impl FailClosedLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trip the latch. Returns `true` for the call that actually tripped it;
    /// later calls keep the original reason.
    pub fn trigger(&self, reason: &str, now_ms: u64) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.triggered_at.store(now_ms, Ordering::SeqCst);
            *self.reason.write() = Some(reason.to_string());
            Metrics::fail_closed(true);
            error!(reason = %reason, "FAIL-CLOSED: refusing all admissions");
            true
        } else {
            warn!(new_reason = %reason, "Fail-closed latch already triggered");
            false
        }
    }

    #[must_use]
    pub fn triggered_at(&self) -> Option<u64> {
        if !self.is_triggered() {
            return None;
        }
        match self.triggered_at.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        if self.is_triggered() {
            self.reason.read().clone()
        } else {
            None
        }
    }

    /// Clear the latch. Returns `true` if it was triggered.
    pub fn reset(&self) -> bool {
        if !self.is_triggered() {
            return false;
        }
        let previous = self.reason.write().take();
        self.triggered_at.store(0, Ordering::SeqCst);
        self.triggered.store(false, Ordering::SeqCst);
        Metrics::fail_closed(false);
        info!(previous_reason = ?previous, "Fail-closed latch cleared");
        true
    }
}
