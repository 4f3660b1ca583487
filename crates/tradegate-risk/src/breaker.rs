//! Circuit breaker and drawdown protection.
//!
//! The transition rules live in [`apply`], a pure function over
//! [`RiskState`]. [`CircuitBreaker`] wraps it with load -> apply ->
//! compare-and-swap against the store, so several evaluators and the
//! reconciler can feed the same account concurrently.
//!
//! States: `CLOSED` and `TRIPPED(resume_at)`.
//! - Consecutive failures reaching the threshold trip the breaker until
//!   `tripped_at + cooldown`.
//! - Realized daily loss reaching the limit trips it until the later of the
//!   cooldown and the next UTC midnight.
//! - A manual trip never clears on its own.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tradegate_core::{
    next_utc_midnight_ms, utc_date, AccountId, AuditEvent, AuditRecord, AuditSink, BreakerState,
    Clock, ErrorKind, Money, RiskState, TripReason,
};
use tradegate_store::{Store, StoreError};
use tradegate_telemetry::Metrics;

use crate::error::{RiskError, RiskResult};

const MAX_CAS_ATTEMPTS: u32 = 8;

// ============================================================================
// BreakerConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive gateway failures that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Realized loss per UTC day that trips the breaker; zero disables.
    #[serde(default)]
    pub daily_loss_limit: Money,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            daily_loss_limit: Money::ZERO,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_secs.saturating_mul(1000)
    }

    pub fn validate(&self) -> RiskResult<()> {
        if self.failure_threshold == 0 {
            return Err(RiskError::Config(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.daily_loss_limit.is_negative() {
            return Err(RiskError::Config(
                "daily_loss_limit must not be negative".into(),
            ));
        }
        Ok(())
    }

    fn daily_loss_breached(&self, daily_pnl: Money) -> bool {
        self.daily_loss_limit.is_positive() && daily_pnl <= -self.daily_loss_limit
    }
}

// ============================================================================
// Events and transitions
// ============================================================================

/// Input to the breaker state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    /// No new information; only time-based rules run.
    Tick,
    /// A command reached `completed`.
    CommandCompleted,
    /// A command failed. Only kinds that feed the breaker are counted.
    CommandFailed { kind: ErrorKind },
    /// A position closed with realized P&L.
    PositionClosed { pnl: Money },
    /// Administrative trip.
    ForceTrip,
    /// Administrative reset.
    ForceClose,
}

impl BreakerEvent {
    fn trigger(&self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::CommandCompleted => "command_completed",
            Self::CommandFailed { .. } => "command_failed",
            Self::PositionClosed { .. } => "position_closed",
            Self::ForceTrip => "manual_trip",
            Self::ForceClose => "manual_reset",
        }
    }
}

/// Observable change of breaker state or trip reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    /// Reason of the trip being entered, or of the trip being cleared.
    pub trip_reason: Option<TripReason>,
    pub trigger: &'static str,
    pub resume_at_ms: Option<u64>,
}

fn clear(state: &mut RiskState) {
    state.tripped = false;
    state.tripped_at_ms = None;
    state.cooldown_until_ms = None;
    state.trip_reason = None;
    state.consecutive_failures = 0;
}

fn resume_at(reason: TripReason, config: &BreakerConfig, tripped_at_ms: u64) -> Option<u64> {
    let cooldown_end = tripped_at_ms.saturating_add(config.cooldown_ms());
    match reason {
        TripReason::ConsecutiveFailures => Some(cooldown_end),
        TripReason::DailyLoss => Some(cooldown_end.max(next_utc_midnight_ms(tripped_at_ms))),
        TripReason::Manual => None,
    }
}

fn trip(state: &mut RiskState, reason: TripReason, config: &BreakerConfig, now_ms: u64) {
    state.tripped = true;
    state.tripped_at_ms = Some(now_ms);
    state.trip_reason = Some(reason);
    state.cooldown_until_ms = resume_at(reason, config, now_ms);
}

/// Apply one event to `state` at `now_ms`.
///
/// Day rollover and cooldown expiry are evaluated first, then the event.
/// Returns the net transition, if the breaker state or trip reason changed.
pub fn apply(
    state: &mut RiskState,
    config: &BreakerConfig,
    event: &BreakerEvent,
    now_ms: u64,
) -> Option<BreakerTransition> {
    let from = state.breaker_state();
    let from_reason = state.trip_reason;
    let mut trigger = event.trigger();

    let today = utc_date(now_ms);
    if today > state.tracking_date {
        state.daily_pnl = Money::ZERO;
        state.tracking_date = today;
    }

    if state.tripped
        && state.trip_reason != Some(TripReason::Manual)
        && state.cooldown_until_ms.map_or(false, |t| now_ms >= t)
    {
        clear(state);
        trigger = "cooldown_elapsed";
    }

    match event {
        BreakerEvent::Tick => {}
        BreakerEvent::CommandCompleted => {
            state.consecutive_failures = 0;
        }
        BreakerEvent::CommandFailed { kind } => {
            if kind.feeds_breaker() {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if !state.tripped && state.consecutive_failures >= config.failure_threshold {
                    trip(state, TripReason::ConsecutiveFailures, config, now_ms);
                    trigger = event.trigger();
                }
            }
        }
        BreakerEvent::PositionClosed { pnl } => {
            state.daily_pnl = state.daily_pnl + *pnl;
            if config.daily_loss_breached(state.daily_pnl) {
                match state.trip_reason {
                    None => {
                        trip(state, TripReason::DailyLoss, config, now_ms);
                        trigger = "daily_loss";
                    }
                    Some(TripReason::ConsecutiveFailures) => {
                        // Keep the original trip time; extend to the day boundary.
                        let tripped_at = state.tripped_at_ms.unwrap_or(now_ms);
                        state.trip_reason = Some(TripReason::DailyLoss);
                        state.cooldown_until_ms = resume_at(TripReason::DailyLoss, config, now_ms)
                            .max(resume_at(TripReason::DailyLoss, config, tripped_at));
                        trigger = "daily_loss";
                    }
                    Some(TripReason::DailyLoss) | Some(TripReason::Manual) => {}
                }
            }
        }
        BreakerEvent::ForceTrip => {
            if state.trip_reason != Some(TripReason::Manual) {
                trip(state, TripReason::Manual, config, now_ms);
                trigger = event.trigger();
            }
        }
        BreakerEvent::ForceClose => {
            clear(state);
            trigger = event.trigger();
        }
    }

    let to = state.breaker_state();
    if from == to && from_reason == state.trip_reason {
        return None;
    }
    Some(BreakerTransition {
        from,
        to,
        trip_reason: if state.tripped {
            state.trip_reason
        } else {
            from_reason
        },
        trigger,
        resume_at_ms: state.cooldown_until_ms,
    })
}

// ============================================================================
// CircuitBreaker
// ============================================================================

/// Store-backed circuit breaker shared by evaluators and the reconciler.
pub struct CircuitBreaker {
    store: Arc<dyn Store>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn Store>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            audit,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Returns `true` if OPEN commands may be dispatched for `account`.
    ///
    /// Persists any cooldown expiry or day rollover it observes.
    pub async fn check(&self, account: &AccountId) -> RiskResult<bool> {
        let state = self.record(account, BreakerEvent::Tick).await?;
        Ok(!state.tripped)
    }

    /// Effective state at the current time, without persisting anything.
    pub async fn state(&self, account: &AccountId) -> RiskResult<RiskState> {
        let now = self.clock.now_ms();
        let mut state = self.store.load_risk_state(account, utc_date(now)).await?;
        apply(&mut state, &self.config, &BreakerEvent::Tick, now);
        Ok(state)
    }

    /// Administrative reset: clear any trip and zero the failure counter.
    pub async fn force_close(&self, account: &AccountId) -> RiskResult<RiskState> {
        info!(account = %account, "Circuit breaker manual reset requested");
        self.record(account, BreakerEvent::ForceClose).await
    }

    /// Administrative trip; stays tripped until [`Self::force_close`].
    pub async fn force_trip(&self, account: &AccountId) -> RiskResult<RiskState> {
        warn!(account = %account, "Circuit breaker manual trip requested");
        self.record(account, BreakerEvent::ForceTrip).await
    }

    /// Feed an event and persist the result with compare-and-swap.
    pub async fn record(&self, account: &AccountId, event: BreakerEvent) -> RiskResult<RiskState> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now_ms();
            let mut state = self.store.load_risk_state(account, utc_date(now)).await?;
            let before = state.clone();
            let transition = apply(&mut state, &self.config, &event, now);

            if state == before {
                return Ok(state);
            }

            match self.store.save_risk_state(&state).await {
                Ok(saved) => {
                    if let Some(transition) = transition {
                        self.emit(account, &saved, &transition, now);
                    }
                    Metrics::breaker_state(
                        account.as_str(),
                        saved.tripped,
                        saved.consecutive_failures,
                        saved.daily_pnl.inner().to_f64().unwrap_or(0.0),
                    );
                    return Ok(saved);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(account = %account, attempt, "Risk state CAS conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RiskError::ConcurrencyExhausted {
            account: account.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    fn emit(&self, account: &AccountId, state: &RiskState, t: &BreakerTransition, now: u64) {
        let reason = t.trip_reason.map(|r| r.as_str()).unwrap_or("none");
        match t.to {
            BreakerState::Tripped => warn!(
                account = %account,
                from = %t.from,
                reason,
                trigger = t.trigger,
                consecutive_failures = state.consecutive_failures,
                daily_pnl = %state.daily_pnl,
                resume_at_ms = ?t.resume_at_ms,
                "Circuit breaker TRIPPED"
            ),
            BreakerState::Closed => info!(
                account = %account,
                reason,
                trigger = t.trigger,
                "Circuit breaker closed"
            ),
        }

        let to = match t.to {
            BreakerState::Tripped => "tripped",
            BreakerState::Closed => "closed",
        };
        Metrics::breaker_transition(account.as_str(), to, reason);

        self.audit.record(&AuditRecord::new(
            now,
            account.clone(),
            AuditEvent::BreakerTransition {
                from: t.from,
                to: t.to,
                trip_reason: t.trip_reason,
                trigger: t.trigger.to_string(),
                consecutive_failures: state.consecutive_failures,
                daily_pnl: state.daily_pnl,
                resume_at_ms: t.resume_at_ms,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use tradegate_core::ManualClock;
    use tradegate_store::MemoryStore;

    // 2024-03-10 23:59:00 UTC
    const LATE_EVENING: u64 = 1_710_115_140_000;
    // 2024-03-10 12:00:00 UTC
    const NOON: u64 = 1_710_072_000_000;

    fn state_at(ms: u64) -> RiskState {
        RiskState::new("acc".into(), utc_date(ms))
    }

    fn failed() -> BreakerEvent {
        BreakerEvent::CommandFailed {
            kind: ErrorKind::CommandRejectedByGateway,
        }
    }

    fn config_with_limit(limit: Money) -> BreakerConfig {
        BreakerConfig {
            daily_loss_limit: limit,
            ..BreakerConfig::default()
        }
    }

    // === pure state machine ===

    #[test]
    fn test_trips_at_threshold() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        for _ in 0..4 {
            assert!(apply(&mut state, &config, &failed(), NOON).is_none());
        }
        assert!(!state.tripped);
        let t = apply(&mut state, &config, &failed(), NOON).unwrap();
        assert_eq!(t.from, BreakerState::Closed);
        assert_eq!(t.to, BreakerState::Tripped);
        assert_eq!(t.trip_reason, Some(TripReason::ConsecutiveFailures));
        assert_eq!(t.resume_at_ms, Some(NOON + 300_000));
        assert_eq!(state.consecutive_failures, 5);
    }

    #[test]
    fn test_success_resets_counter() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        for _ in 0..4 {
            apply(&mut state, &config, &failed(), NOON);
        }
        apply(&mut state, &config, &BreakerEvent::CommandCompleted, NOON);
        assert_eq!(state.consecutive_failures, 0);
        apply(&mut state, &config, &failed(), NOON);
        assert!(!state.tripped);
    }

    #[test]
    fn test_admission_rejections_do_not_count() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        for kind in [
            ErrorKind::SignalRejected,
            ErrorKind::ExposureLimitReached,
            ErrorKind::RiskLimitExceeded,
            ErrorKind::CircuitBreakerOpen,
        ] {
            apply(&mut state, &config, &BreakerEvent::CommandFailed { kind }, NOON);
        }
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_cooldown_clears_and_resets_counter() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        for _ in 0..5 {
            apply(&mut state, &config, &failed(), NOON);
        }
        assert!(apply(&mut state, &config, &BreakerEvent::Tick, NOON + 299_999).is_none());
        assert!(state.tripped);

        let t = apply(&mut state, &config, &BreakerEvent::Tick, NOON + 300_000).unwrap();
        assert_eq!(t.to, BreakerState::Closed);
        assert_eq!(t.trigger, "cooldown_elapsed");
        assert_eq!(t.trip_reason, Some(TripReason::ConsecutiveFailures));
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_failures_while_tripped_keep_counting() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        for _ in 0..7 {
            apply(&mut state, &config, &failed(), NOON);
        }
        assert!(state.tripped);
        assert_eq!(state.consecutive_failures, 7);
        assert_eq!(state.tripped_at_ms, Some(NOON));
    }

    #[test]
    fn test_daily_loss_trip_requires_rollover() {
        let config = BreakerConfig {
            cooldown_secs: 60,
            ..config_with_limit(Money::new(dec!(100)))
        };
        let mut state = state_at(NOON);
        apply(
            &mut state,
            &config,
            &BreakerEvent::PositionClosed {
                pnl: Money::new(dec!(-60)),
            },
            NOON,
        );
        assert!(!state.tripped);
        let t = apply(
            &mut state,
            &config,
            &BreakerEvent::PositionClosed {
                pnl: Money::new(dec!(-40)),
            },
            NOON,
        )
        .unwrap();
        assert_eq!(t.trip_reason, Some(TripReason::DailyLoss));

        // Cooldown alone is not enough.
        apply(&mut state, &config, &BreakerEvent::Tick, NOON + 3_600_000);
        assert!(state.tripped);

        let midnight = next_utc_midnight_ms(NOON);
        let t = apply(&mut state, &config, &BreakerEvent::Tick, midnight).unwrap();
        assert_eq!(t.to, BreakerState::Closed);
        assert_eq!(state.daily_pnl, Money::ZERO);
        assert_eq!(state.tracking_date, utc_date(midnight));
    }

    #[test]
    fn test_daily_loss_near_midnight_still_waits_cooldown() {
        let config = config_with_limit(Money::new(dec!(10)));
        let mut state = state_at(LATE_EVENING);
        apply(
            &mut state,
            &config,
            &BreakerEvent::PositionClosed {
                pnl: Money::new(dec!(-10)),
            },
            LATE_EVENING,
        );
        assert!(state.tripped);
        assert_eq!(state.cooldown_until_ms, Some(LATE_EVENING + 300_000));

        // Past midnight but inside the cooldown.
        apply(&mut state, &config, &BreakerEvent::Tick, LATE_EVENING + 120_000);
        assert!(state.tripped);
        assert_eq!(state.daily_pnl, Money::ZERO);
    }

    #[test]
    fn test_zero_limit_disables_daily_loss() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        apply(
            &mut state,
            &config,
            &BreakerEvent::PositionClosed {
                pnl: Money::new(dec!(-1_000_000)),
            },
            NOON,
        );
        assert!(!state.tripped);
        assert_eq!(state.daily_pnl, Money::new(dec!(-1_000_000)));
    }

    #[test]
    fn test_daily_loss_upgrades_failure_trip() {
        let config = config_with_limit(Money::new(dec!(50)));
        let mut state = state_at(NOON);
        for _ in 0..5 {
            apply(&mut state, &config, &failed(), NOON);
        }
        let t = apply(
            &mut state,
            &config,
            &BreakerEvent::PositionClosed {
                pnl: Money::new(dec!(-75)),
            },
            NOON + 1_000,
        )
        .unwrap();
        assert_eq!(t.from, BreakerState::Tripped);
        assert_eq!(t.to, BreakerState::Tripped);
        assert_eq!(t.trip_reason, Some(TripReason::DailyLoss));
        assert_eq!(state.cooldown_until_ms, Some(next_utc_midnight_ms(NOON)));
        assert_eq!(state.tripped_at_ms, Some(NOON));
    }

    #[test]
    fn test_manual_trip_does_not_auto_clear() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        let t = apply(&mut state, &config, &BreakerEvent::ForceTrip, NOON).unwrap();
        assert_eq!(t.trip_reason, Some(TripReason::Manual));
        assert_eq!(t.resume_at_ms, None);

        apply(&mut state, &config, &BreakerEvent::Tick, NOON + 86_400_000 * 3);
        assert!(state.tripped);

        let t = apply(&mut state, &config, &BreakerEvent::ForceClose, NOON + 1).unwrap();
        assert_eq!(t.to, BreakerState::Closed);
        assert_eq!(t.trigger, "manual_reset");
        assert!(!state.tripped);
    }

    #[test]
    fn test_force_close_zeroes_failures_without_transition() {
        let config = BreakerConfig::default();
        let mut state = state_at(NOON);
        apply(&mut state, &config, &failed(), NOON);
        assert!(apply(&mut state, &config, &BreakerEvent::ForceClose, NOON).is_none());
        assert_eq!(state.consecutive_failures, 0);
    }

    // === store-backed service ===

    #[derive(Default)]
    struct CaptureSink(Mutex<Vec<AuditRecord>>);

    impl AuditSink for CaptureSink {
        fn record(&self, record: &AuditRecord) {
            self.0.lock().push(record.clone());
        }
    }

    fn service(clock: Arc<ManualClock>, sink: Arc<CaptureSink>) -> (Arc<MemoryStore>, CircuitBreaker) {
        let store = Arc::new(MemoryStore::new());
        let breaker = CircuitBreaker::new(store.clone(), BreakerConfig::default(), clock, sink);
        (store, breaker)
    }

    #[tokio::test]
    async fn test_service_trips_and_resumes_after_cooldown() {
        let clock = Arc::new(ManualClock::new(NOON));
        let sink = Arc::new(CaptureSink::default());
        let (_store, breaker) = service(clock.clone(), sink.clone());
        let account: AccountId = "acc".into();

        for _ in 0..5 {
            breaker.record(&account, failed()).await.unwrap();
        }
        assert!(!breaker.check(&account).await.unwrap());

        clock.advance_secs(300);
        assert!(breaker.check(&account).await.unwrap());
        let state = breaker.state(&account).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);

        let transitions: Vec<_> = sink
            .0
            .lock()
            .iter()
            .filter(|r| matches!(r.event, AuditEvent::BreakerTransition { .. }))
            .cloned()
            .collect();
        assert_eq!(transitions.len(), 2);
    }

    #[tokio::test]
    async fn test_service_concurrent_failures_all_counted() {
        let clock = Arc::new(ManualClock::new(NOON));
        let (_store, breaker) = service(clock, Arc::new(CaptureSink::default()));
        let account: AccountId = "acc".into();

        let (a, b, c) = tokio::join!(
            breaker.record(&account, failed()),
            breaker.record(&account, failed()),
            breaker.record(&account, failed()),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert_eq!(breaker.state(&account).await.unwrap().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_service_manual_trip_and_reset() {
        let clock = Arc::new(ManualClock::new(NOON));
        let (_store, breaker) = service(clock.clone(), Arc::new(CaptureSink::default()));
        let account: AccountId = "acc".into();

        breaker.force_trip(&account).await.unwrap();
        clock.advance_secs(86_400);
        assert!(!breaker.check(&account).await.unwrap());

        let state = breaker.force_close(&account).await.unwrap();
        assert!(!state.tripped);
        assert!(breaker.check(&account).await.unwrap());
    }

    #[tokio::test]
    async fn test_service_surfaces_storage_failure() {
        let clock = Arc::new(ManualClock::new(NOON));
        let (store, breaker) = service(clock, Arc::new(CaptureSink::default()));
        store.set_available(false);
        let err = breaker.check(&"acc".into()).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
