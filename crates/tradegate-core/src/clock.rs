//! Millisecond time source.
//!
//! Every time-dependent rule (staleness, dedup window, cooldown, command
//! timeout, day rollover) reads time through [`Clock`] so tests can move
//! time explicitly with [`ManualClock`].

use chrono::{DateTime, Days, NaiveDate};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for obtaining current time, allowing for testing with mock clocks.
pub trait Clock: Send + Sync {
    /// Returns current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta: u64) {
        self.advance_ms(delta * 1000);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// UTC calendar day containing `ms`.
pub fn utc_date(ms: u64) -> NaiveDate {
    DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// First millisecond of the UTC day following the one containing `ms`.
pub fn next_utc_midnight_ms(ms: u64) -> u64 {
    utc_date(ms)
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis().max(0) as u64)
        .unwrap_or(u64::MAX)
}
