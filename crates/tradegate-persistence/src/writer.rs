//! JSON Lines audit writer.
//!
//! Uses JSON Lines format (.jsonl):
//! - Each line is a complete JSON object
//! - Files are opened in append mode and never truncated
//! - Every record is flushed before `record` returns
//! - The file rotates when a record's UTC date differs from the open file's

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tradegate_core::{utc_date, AuditRecord, AuditSink};

use crate::error::PersistenceResult;

/// Active writer state for one daily file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Append-only daily audit log (`audit_YYYY-MM-DD.jsonl`).
pub struct JsonLinesAuditSink {
    base_dir: PathBuf,
    active: Mutex<Option<ActiveWriter>>,
}

impl JsonLinesAuditSink {
    /// Create the sink, creating `base_dir` if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: Mutex::new(None),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the file holding records dated `date` (`YYYY-MM-DD`).
    pub fn path_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("audit_{date}.jsonl"))
    }

    fn open(&self, date: &str) -> PersistenceResult<ActiveWriter> {
        let path = self.path_for(date);
        info!(path = %path.display(), "Opening audit log (append mode)");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }

    fn close(active: &mut ActiveWriter) {
        if let Err(e) = active.writer.flush() {
            warn!(?e, "Failed to flush audit log on close");
        }
        info!(
            date = %active.date,
            records = active.records_written,
            "Closed audit log"
        );
    }

    /// Append one record and flush it to disk.
    pub fn write(&self, record: &AuditRecord) -> PersistenceResult<()> {
        let date = utc_date(record.at_ms).format("%Y-%m-%d").to_string();
        let line = serde_json::to_string(record)?;

        let mut guard = self.active.lock();
        let active = match guard.take() {
            Some(active) if active.date == date => active,
            Some(mut stale) => {
                Self::close(&mut stale);
                self.open(&date)?
            }
            None => self.open(&date)?,
        };
        let active = guard.insert(active);

        writeln!(active.writer, "{line}")?;
        active.writer.flush()?;
        active.records_written += 1;
        debug!(date = %date, event = record.event.name(), "Audit record written");
        Ok(())
    }

    /// Records written to the currently open file.
    pub fn records_written(&self) -> usize {
        self.active
            .lock()
            .as_ref()
            .map_or(0, |active| active.records_written)
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, record: &AuditRecord) {
        if let Err(e) = self.write(record) {
            warn!(error = %e, event = record.event.name(), "Failed to write audit record");
        }
    }
}

impl Drop for JsonLinesAuditSink {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.get_mut().take() {
            Self::close(&mut active);
        }
    }
}
