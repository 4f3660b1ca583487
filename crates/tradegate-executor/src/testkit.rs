//! Shared fixtures for executor unit tests.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use tradegate_core::{
    AccountId, AuditRecord, AuditSink, Direction, InstrumentBook, InstrumentEntry,
    InstrumentRiskConfig, InstrumentSpec, ManualClock, Money, Price, Signal, SignalStatus,
    Timeframe, Volume,
};
use tradegate_risk::{BalanceTier, SizingConfig};
use tradegate_store::{MemoryStore, Store};

use crate::context::{ControllerSettings, ExecutionContext};

/// 2024-03-10T12:00:00Z
pub const T0: u64 = 1_710_072_000_000;
pub const ACCOUNT: &str = "acc";

#[derive(Default)]
pub struct CaptureAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl CaptureAudit {
    pub fn names(&self) -> Vec<&'static str> {
        self.records.lock().iter().map(|r| r.event.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event.name() == name)
            .count()
    }
}

impl AuditSink for CaptureAudit {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<CaptureAudit>,
    pub ctx: Arc<ExecutionContext>,
}

impl Harness {
    pub fn account(&self) -> AccountId {
        ACCOUNT.into()
    }
}

pub fn eurusd() -> InstrumentEntry {
    InstrumentEntry {
        instrument: "EURUSD".into(),
        risk: InstrumentRiskConfig {
            max_loss_per_trade: Money::new(dec!(5)),
            max_positions: 1,
            min_confidence: dec!(70),
            risk_multiplier: Decimal::ONE,
            paused: false,
        },
        spec: InstrumentSpec {
            price_precision: 5,
            unit_value: dec!(100000),
            min_volume: Volume::new(dec!(0.001)),
            max_volume: Volume::new(dec!(10)),
            volume_step: Volume::new(dec!(0.001)),
        },
    }
}

/// One tier capped at 0.01 so sizing is predictable.
pub fn settings() -> ControllerSettings {
    ControllerSettings {
        sizing: SizingConfig {
            tiers: vec![BalanceTier {
                min_balance: Money::ZERO,
                base_volume: Volume::new(dec!(0.01)),
                max_volume: Volume::new(dec!(0.01)),
            }],
            ..SizingConfig::default()
        },
        ..ControllerSettings::default()
    }
}

pub async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .set_account_balance(&ACCOUNT.into(), Money::new(dec!(10000)))
        .await
        .unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let audit = Arc::new(CaptureAudit::default());
    let ctx = Arc::new(ExecutionContext::new(
        store.clone(),
        Arc::new(InstrumentBook::new([eurusd()])),
        &settings(),
        clock.clone(),
        audit.clone(),
    ));
    Harness {
        store,
        clock,
        audit,
        ctx,
    }
}

/// BUY EURUSD/H1 at 1.1000, confidence 80.
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
