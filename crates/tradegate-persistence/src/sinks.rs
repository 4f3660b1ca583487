//! In-process audit sinks.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use tradegate_core::{AuditRecord, AuditSink};

/// Emits each record as a structured event at target `tradegate::audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let payload = serde_json::to_string(&record.event).unwrap_or_default();
        info!(
            target: "tradegate::audit",
            at_ms = record.at_ms,
            account = %record.account,
            event = record.event.name(),
            payload = %payload,
            "audit"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records whose event name is `name` (e.g. `"admission"`).
    pub fn named(&self, name: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event.name() == name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Forwards every record to each inner sink, in order.
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradegate_core::AuditEvent;

    fn record(event: AuditEvent) -> AuditRecord {
        AuditRecord::new(0, "acc".into(), event)
    }

    #[test]
    fn test_memory_sink_filters_by_name() {
        let sink = MemoryAuditSink::new();
        sink.record(&record(AuditEvent::FailClosedCleared));
        sink.record(&record(AuditEvent::FailClosed {
            error: "io".into(),
        }));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.named("fail_closed").len(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAuditSink::new());
        let b = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new(vec![a.clone()])
            .with(b.clone())
            .with(Arc::new(TracingAuditSink));
        assert_eq!(fanout.len(), 3);

        fanout.record(&record(AuditEvent::FailClosedCleared));
        assert_eq!(a.len(), 1);
        assert_eq!(b.records(), a.records());
    }
}
