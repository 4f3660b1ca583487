//! Exposure tracking.
//!
//! Committed exposure for a key is open positions plus in-flight OPEN
//! commands. The store's slot constraint is authoritative; the per-key lock
//! table only keeps same-key admissions in this process from racing each
//! other into that constraint.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use tradegate_core::ExposureKey;
use tradegate_store::Store;

use crate::error::RiskResult;

pub struct ExposureTracker {
    store: Arc<dyn Store>,
    locks: DashMap<ExposureKey, Arc<Mutex<()>>>,
}

impl ExposureTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Open positions plus pending/processing commands for `key`.
    pub async fn committed(&self, key: &ExposureKey) -> RiskResult<u32> {
        Ok(self.store.committed_count(key).await?)
    }

    /// True iff another entry fits under `max_positions`.
    pub async fn admit(&self, key: &ExposureKey, max_positions: u32) -> RiskResult<bool> {
        let committed = self.committed(key).await?;
        trace!(key = %key, committed, max_positions, "Exposure check");
        Ok(committed < max_positions)
    }

    /// Acquire the in-process lock for `key`.
    pub async fn lock(&self, key: &ExposureKey) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on. Returns the number removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        before - self.locks.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tradegate_core::{Command, CommandPayload, Direction, Price, Timeframe, Volume};
    use tradegate_store::MemoryStore;

    fn key() -> ExposureKey {
        ExposureKey::new("acc".into(), "EURUSD".into(), Timeframe::H1)
    }

    #[tokio::test]
    async fn test_admit_counts_pending_commands() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ExposureTracker::new(store.clone());
        assert!(tracker.admit(&key(), 1).await.unwrap());

        let cmd = Command::open(
            "acc".into(),
            CommandPayload {
                instrument: "EURUSD".into(),
                timeframe: Timeframe::H1,
                direction: Direction::Buy,
                volume: Volume::new(dec!(0.01)),
                entry_price: Some(Price::new(dec!(1.1))),
                stop_loss: Some(Price::new(dec!(1.096))),
                take_profit: None,
                target_broker_id: None,
            },
            "sig-1".into(),
            "fp-1".into(),
            0,
        );
        store.create_open_command(&cmd, 1).await.unwrap();

        assert_eq!(tracker.committed(&key()).await.unwrap(), 1);
        assert!(!tracker.admit(&key(), 1).await.unwrap());
        assert!(tracker.admit(&key(), 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_serializes_same_key() {
        let tracker = ExposureTracker::new(Arc::new(MemoryStore::new()));
        let guard = tracker.lock(&key()).await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), tracker.lock(&key())).await;
        assert!(blocked.is_err());

        let other = ExposureKey::new("acc".into(), "EURUSD".into(), Timeframe::H4);
        let free = tokio::time::timeout(Duration::from_millis(20), tracker.lock(&other)).await;
        assert!(free.is_ok());

        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(20), tracker.lock(&key())).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let tracker = ExposureTracker::new(Arc::new(MemoryStore::new()));
        let held = tracker.lock(&key()).await;
        {
            let other = ExposureKey::new("acc".into(), "GBPUSD".into(), Timeframe::H1);
            let _g = tracker.lock(&other).await;
        }
        assert_eq!(tracker.lock_count(), 2);
        assert_eq!(tracker.prune(), 1);
        assert_eq!(tracker.lock_count(), 1);
        drop(held);
    }
}
