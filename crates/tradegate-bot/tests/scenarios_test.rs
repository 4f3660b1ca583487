//! End-to-end admission scenarios through the wired application.
//!
//! - Loss within cap: admitted unmodified
//! - Loss above cap: volume shrunk to fit
//! - Concurrent same-key admissions: exactly one wins
//! - Repeated gateway failures: breaker trips and recovers after cooldown
//! - Replays and storage loss

mod integration;
use integration::common::{app, app_with_store, config, signal, T0};

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::task::JoinSet;

use tradegate_core::{AdmissionDecision, CommandStatus, Money, RejectReason, Volume};
use tradegate_executor::{Evaluator, PaperConfig, PaperGateway, PaperPolicy, Reconciler};
use tradegate_store::{MemoryStore, SqliteStore, Store};

#[tokio::test]
async fn test_loss_within_cap_is_admitted_unmodified() {
    let t = app("0.01").await;
    let dispatcher = t.app.dispatcher(&t.account());

    let decision = dispatcher.on_signal(&signal("sig-a", dec!(1.0960))).await;
    match decision {
        AdmissionDecision::Admitted {
            volume,
            original_volume,
            potential_loss,
            ..
        } => {
            assert_eq!(volume, Volume::new(dec!(0.01)));
            assert_eq!(original_volume, None);
            assert_eq!(potential_loss, Money::new(dec!(4)));
        }
        other => panic!("expected admission, got {other:?}"),
    }
    assert_eq!(t.audit.named("command_dispatched").len(), 1);
}

#[tokio::test]
async fn test_loss_above_cap_shrinks_volume() {
    let t = app("0.03").await;
    let dispatcher = t.app.dispatcher(&t.account());

    let decision = dispatcher.on_signal(&signal("sig-b", dec!(1.0960))).await;
    match decision {
        AdmissionDecision::Admitted {
            volume,
            original_volume,
            potential_loss,
            ..
        } => {
            assert_eq!(original_volume, Some(Volume::new(dec!(0.03))));
            assert_eq!(volume, Volume::new(dec!(0.012)));
            assert_eq!(potential_loss, Money::new(dec!(4.8)));
            assert!(potential_loss <= Money::new(dec!(5)));
        }
        other => panic!("expected admission, got {other:?}"),
    }
}

async fn race_same_key(store: Arc<dyn Store>) {
    let t = app_with_store(config("0.01"), store).await;
    let account = t.account();
    let app = Arc::new(t.app);

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        // Separate dispatchers model separate evaluators.
        let dispatcher = app.dispatcher(&account);
        let sig = signal(&format!("sig-{i}"), dec!(1.0960) - Decimal::new(i, 4));
        tasks.spawn(async move { dispatcher.on_signal(&sig).await });
    }

    let mut admitted = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            AdmissionDecision::Admitted { .. } => admitted += 1,
            AdmissionDecision::Rejected { reason } => {
                assert_eq!(reason, RejectReason::ExposureLimitReached);
            }
        }
    }
    assert_eq!(admitted, 1);

    let pending = app
        .context()
        .store
        .commands_with_status(CommandStatus::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_concurrent_same_key_admits_once_memory() {
    race_same_key(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_concurrent_same_key_admits_once_sqlite() {
    race_same_key(Arc::new(SqliteStore::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn test_pending_command_blocks_second_evaluator() {
    let t = app("0.01").await;
    let first = t.app.dispatcher(&t.account());
    let second = t.app.dispatcher(&t.account());

    assert!(first.on_signal(&signal("sig-1", dec!(1.0960))).await.is_admitted());
    t.clock.advance_ms(50);
    let decision = second.on_signal(&signal("sig-2", dec!(1.0950))).await;
    assert_eq!(
        decision.reject_reason(),
        Some(RejectReason::ExposureLimitReached)
    );
}

#[tokio::test]
async fn test_breaker_trips_and_recovers_after_cooldown() {
    let t = app("0.01").await;
    let ctx = t.app.context().clone();
    let dispatcher = t.app.dispatcher(&t.account());
    let gateway = PaperGateway::new(
        PaperConfig {
            policy: PaperPolicy::Reject {
                reason: "no liquidity".into(),
            },
            ..PaperConfig::default()
        },
        ctx.store.clone(),
        ctx.clock.clone(),
    );
    let reconciler = Reconciler::new(t.app.config().reconciler.clone(), ctx.clone());

    for i in 0..5 {
        let sl = dec!(1.0960) - Decimal::new(i, 4);
        let decision = dispatcher.on_signal(&signal(&format!("fail-{i}"), sl)).await;
        assert!(decision.is_admitted(), "attempt {i}: {decision:?}");
        gateway.poll_once().await.unwrap();
        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.failed, 1);
    }

    let state = t.app.breaker_status(&t.account()).await.unwrap();
    assert!(state.tripped);
    assert_eq!(state.consecutive_failures, 5);

    let mut sixth = signal("sig-6", dec!(1.0900));
    sixth.confidence = dec!(99);
    assert_eq!(
        dispatcher.on_signal(&sixth).await.reject_reason(),
        Some(RejectReason::CircuitBreakerOpen)
    );

    t.clock.advance_secs(300);
    let mut seventh = signal("sig-7", dec!(1.0905));
    seventh.created_at_ms = T0 + 299_000;
    assert!(dispatcher.on_signal(&seventh).await.is_admitted());

    let state = t.app.breaker_status(&t.account()).await.unwrap();
    assert!(!state.tripped);
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn test_gateway_rejects_trip_breaker_whatever_the_reason() {
    let t = app("0.01").await;
    let ctx = t.app.context().clone();
    let dispatcher = t.app.dispatcher(&t.account());
    let gateway = PaperGateway::new(
        PaperConfig {
            policy: PaperPolicy::Reject {
                reason: "cancelled".into(),
            },
            ..PaperConfig::default()
        },
        ctx.store.clone(),
        ctx.clock.clone(),
    );
    let reconciler = Reconciler::new(t.app.config().reconciler.clone(), ctx.clone());

    for i in 0..5 {
        let sl = dec!(1.0960) - Decimal::new(i, 4);
        assert!(dispatcher
            .on_signal(&signal(&format!("rej-{i}"), sl))
            .await
            .is_admitted());
        assert_eq!(gateway.poll_once().await.unwrap().rejected, 1);
        assert_eq!(reconciler.sweep().await.unwrap().failed, 1);
    }

    let state = t.app.breaker_status(&t.account()).await.unwrap();
    assert!(state.tripped);
    assert_eq!(state.consecutive_failures, 5);
}

#[tokio::test]
async fn test_admin_breaker_trip_and_reset() {
    let t = app("0.01").await;
    let dispatcher = t.app.dispatcher(&t.account());

    assert!(t.app.breaker_trip(&t.account()).await.unwrap().tripped);
    assert_eq!(
        dispatcher
            .on_signal(&signal("sig-1", dec!(1.0960)))
            .await
            .reject_reason(),
        Some(RejectReason::CircuitBreakerOpen)
    );

    // Manual trips ignore the cooldown.
    t.clock.advance_secs(3_600);
    assert!(t.app.breaker_status(&t.account()).await.unwrap().tripped);

    assert!(!t.app.breaker_reset(&t.account()).await.unwrap().tripped);
    let mut fresh = signal("sig-1", dec!(1.0960));
    fresh.created_at_ms = T0 + 3_599_000;
    assert!(dispatcher.on_signal(&fresh).await.is_admitted());
}

#[tokio::test]
async fn test_replayed_signal_never_dispatches_twice() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let t = app_with_store(config("0.01"), store).await;
    let sig = signal("sig-1", dec!(1.0960));

    let first = t.app.dispatcher(&t.account());
    let token = first.on_signal(&sig).await.token().cloned().unwrap();
    assert_eq!(
        first.on_signal(&sig).await.reject_reason(),
        Some(RejectReason::Duplicate)
    );

    // Free the slot, then replay through a dispatcher with an empty cache,
    // as after a restart.
    assert!(t.app.cancel(&t.account(), token.as_str()).await.unwrap());
    let restarted = t.app.dispatcher(&t.account());
    assert_eq!(
        restarted.on_signal(&sig).await.reject_reason(),
        Some(RejectReason::Duplicate)
    );

    let all_pending = t
        .app
        .context()
        .store
        .commands_with_status(CommandStatus::Pending)
        .await
        .unwrap();
    assert!(all_pending.is_empty());
}

#[tokio::test]
async fn test_storage_loss_fails_closed_until_healthy() {
    let store = Arc::new(MemoryStore::new());
    let t = app_with_store(config("0.01"), store.clone()).await;
    let evaluator = Evaluator::new(
        t.app.config().evaluator.clone(),
        Arc::new(t.app.dispatcher(&t.account())),
    );
    store.upsert_signal(&signal("sig-1", dec!(1.0960))).await.unwrap();

    store.set_available(false);
    assert!(evaluator.tick().await.is_err());
    assert!(t.app.context().latch.is_triggered());
    assert_eq!(t.audit.named("fail_closed").len(), 1);

    // The store is back but the latch holds until a tick re-checks health.
    store.set_available(true);
    let direct = t.app.dispatcher(&t.account());
    assert_eq!(
        direct
            .on_signal(&signal("sig-2", dec!(1.0950)))
            .await
            .reject_reason(),
        Some(RejectReason::StorageUnavailable)
    );

    let summary = evaluator.tick().await.unwrap();
    assert_eq!(summary.admitted, 1);
    assert!(!t.app.context().latch.is_triggered());
    assert_eq!(t.audit.named("fail_closed_cleared").len(), 1);
}
