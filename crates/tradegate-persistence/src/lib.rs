//! Audit sinks and JSON Lines import.
//!
//! Audit records are written as JSON Lines (`.jsonl`): one complete object
//! per line, append-only, one file per UTC day. A torn write only damages
//! the last line.

pub mod error;
pub mod reader;
pub mod sinks;
pub mod writer;

pub use error::{PersistenceError, PersistenceResult};
pub use reader::{read_jsonl, read_signals};
pub use sinks::{FanoutAuditSink, MemoryAuditSink, TracingAuditSink};
pub use writer::JsonLinesAuditSink;
