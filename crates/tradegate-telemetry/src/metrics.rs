//! Prometheus metrics for tradegate.
//!
//! Covers:
//! - Admission decisions by outcome and reason
//! - Circuit breaker state, counters and transitions per account
//! - Command lifecycle (dispatch, timeout, settlement)
//! - Dedup cache size and evaluation latency
//! - Fail-closed latch state
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means a duplicate metric name, which is a programming error that should
//! crash at startup. These panics only occur during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};

use crate::error::TelemetryResult;

/// Admission decisions.
/// Labels: outcome (admitted/rejected), reason (reject reason or "none")
pub static ADMISSIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_admissions_total",
        "Total admission decisions",
        &["outcome", "reason"]
    )
    .unwrap()
});

/// Admitted volume that the stop-loss enforcer had to shrink.
pub static VOLUME_SHRUNK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_volume_shrunk_total",
        "Admissions whose volume was reduced to fit the loss cap",
        &["instrument"]
    )
    .unwrap()
});

/// Circuit breaker state (1 = tripped, 0 = closed).
pub static BREAKER_TRIPPED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tradegate_breaker_tripped",
        "Circuit breaker state per account (1=tripped)",
        &["account"]
    )
    .unwrap()
});

/// Breaker transitions.
/// Labels: account, to (closed/tripped), reason
pub static BREAKER_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_breaker_transitions_total",
        "Total circuit breaker transitions",
        &["account", "to", "reason"]
    )
    .unwrap()
});

pub static CONSECUTIVE_FAILURES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tradegate_consecutive_failures",
        "Consecutive command failures per account",
        &["account"]
    )
    .unwrap()
});

pub static DAILY_PNL: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tradegate_daily_pnl",
        "Realized profit/loss for the current UTC day",
        &["account"]
    )
    .unwrap()
});

pub static COMMANDS_DISPATCHED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_commands_dispatched_total",
        "Commands persisted for the gateway",
        &["command_type"]
    )
    .unwrap()
});

pub static COMMAND_TIMEOUTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_command_timeouts_total",
        "Commands failed by the reconciler after the timeout",
        &["command_type"]
    )
    .unwrap()
});

/// Settled command outcomes.
/// Labels: command_type, status (completed/failed)
pub static COMMANDS_SETTLED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_commands_settled_total",
        "Terminal command outcomes consumed by the reconciler",
        &["command_type", "status"]
    )
    .unwrap()
});

pub static DEDUP_CACHE_SIZE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tradegate_dedup_cache_size",
        "Fingerprints held in the dedup window",
        &["account"]
    )
    .unwrap()
});

/// Evaluation tick latency in milliseconds.
pub static EVALUATION_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tradegate_evaluation_latency_ms",
        "Evaluator tick latency in milliseconds",
        &["account"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Fail-closed latch (1 = refusing admissions).
pub static FAIL_CLOSED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tradegate_fail_closed",
        "Fail-closed latch state (1=refusing all admissions)"
    )
    .unwrap()
});

pub static STORE_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tradegate_store_errors_total",
        "Storage errors by operation",
        &["op"]
    )
    .unwrap()
});

/// Metrics facade for convenient recording.
pub struct Metrics;

impl Metrics {
    /// Record an admission decision. `reason` is `None` for admissions.
    pub fn admission(reason: Option<&str>) {
        let (outcome, reason) = match reason {
            Some(r) => ("rejected", r),
            None => ("admitted", "none"),
        };
        ADMISSIONS_TOTAL
            .with_label_values(&[outcome, reason])
            .inc();
    }

    pub fn volume_shrunk(instrument: &str) {
        VOLUME_SHRUNK_TOTAL.with_label_values(&[instrument]).inc();
    }

    /// Publish the breaker gauges for an account.
    pub fn breaker_state(account: &str, tripped: bool, consecutive_failures: u32, daily_pnl: f64) {
        BREAKER_TRIPPED
            .with_label_values(&[account])
            .set(if tripped { 1.0 } else { 0.0 });
        CONSECUTIVE_FAILURES
            .with_label_values(&[account])
            .set(f64::from(consecutive_failures));
        DAILY_PNL.with_label_values(&[account]).set(daily_pnl);
    }

    pub fn breaker_transition(account: &str, to: &str, reason: &str) {
        BREAKER_TRANSITIONS_TOTAL
            .with_label_values(&[account, to, reason])
            .inc();
    }

    pub fn command_dispatched(command_type: &str) {
        COMMANDS_DISPATCHED_TOTAL
            .with_label_values(&[command_type])
            .inc();
    }

    pub fn command_timeout(command_type: &str) {
        COMMAND_TIMEOUTS_TOTAL
            .with_label_values(&[command_type])
            .inc();
    }

    pub fn command_settled(command_type: &str, status: &str) {
        COMMANDS_SETTLED_TOTAL
            .with_label_values(&[command_type, status])
            .inc();
    }

    pub fn dedup_cache_size(account: &str, size: usize) {
        DEDUP_CACHE_SIZE
            .with_label_values(&[account])
            .set(size as f64);
    }

    pub fn evaluation_latency(account: &str, latency_ms: f64) {
        EVALUATION_LATENCY_MS
            .with_label_values(&[account])
            .observe(latency_ms);
    }

    pub fn fail_closed(active: bool) {
        FAIL_CLOSED.set(i64::from(active));
    }

    pub fn store_error(op: &str) {
        STORE_ERRORS_TOTAL.with_label_values(&[op]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
