//! Fixtures: a small config, a manual clock and an in-memory audit sink.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use tradegate_bot::{AppConfig, Application};
use tradegate_core::{
    AccountId, Direction, ManualClock, Price, Signal, SignalStatus, Timeframe,
};
use tradegate_persistence::MemoryAuditSink;
use tradegate_store::Store;

/// 2024-03-10T12:00:00Z
pub const T0: u64 = 1_710_072_000_000;

pub const ACCOUNT: &str = "acc-1";

/// EURUSD capped at $5 per trade, one slot per key, one sizing tier whose
/// ceiling is `tier_max`.
pub fn config_toml(tier_max: &str) -> String {
    format!(
        r#"
        [store]
        url = "memory"

        [[accounts]]
        id = "{ACCOUNT}"
        initial_balance = "10000"

        [[instruments]]
        instrument = "EURUSD"

        [instruments.risk]
        max_loss_per_trade = "5"
        max_positions = 1
        min_confidence = "70"

        [instruments.spec]
        price_precision = 5
        unit_value = "100000"
        min_volume = "0.001"
        max_volume = "10"
        volume_step = "0.001"

        [sizing]
        [[sizing.tiers]]
        min_balance = "0"
        base_volume = "0.01"
        max_volume = "{tier_max}"

        [breaker]
        failure_threshold = 5
        cooldown_secs = 300

        [reconciler]
        command_timeout_secs = 60

        [paper]
        enabled = true
        "#
    )
}

pub fn config(tier_max: &str) -> AppConfig {
    AppConfig::from_toml_str(&config_toml(tier_max)).expect("fixture config is valid")
}

pub struct TestApp {
    pub app: Application,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
}

impl TestApp {
    pub fn account(&self) -> AccountId {
        ACCOUNT.into()
    }
}

/// Application over `store` with a manual clock at [`T0`].
pub async fn app_with_store(config: AppConfig, store: Arc<dyn Store>) -> TestApp {
    let clock = Arc::new(ManualClock::new(T0));
    let audit = Arc::new(MemoryAuditSink::new());
    let app = Application::with_parts(config, store, clock.clone(), audit.clone())
        .await
        .expect("application builds");
    TestApp { app, clock, audit }
}

pub async fn app(tier_max: &str) -> TestApp {
    app_with_store(
        config(tier_max),
        Arc::new(tradegate_store::MemoryStore::new()),
    )
    .await
}

/// BUY EURUSD/H1 at 1.1000 with confidence 80, created one second before T0.
pub fn signal(id: &str, stop_loss: Decimal) -> Signal {
    Signal {
        id: id.to_string(),
        instrument: "EURUSD".into(),
        timeframe: Timeframe::H1,
        direction: Direction::Buy,
        confidence: dec!(80),
        entry_price: Price::new(dec!(1.1000)),
        stop_loss: Some(Price::new(stop_loss)),
        take_profit: None,
        created_at_ms: T0 - 1_000,
        status: SignalStatus::Active,
    }
}
