//! JSON Lines import.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use tradegate_core::Signal;

use crate::error::{PersistenceError, PersistenceResult};

/// Parse every non-blank line of `path` as a `T`.
///
/// Fails on the first malformed line, reporting its 1-based number.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> PersistenceResult<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).map_err(|e| PersistenceError::MalformedLine {
            line: idx + 1,
            message: e.to_string(),
        })?;
        out.push(value);
    }
    debug!(path = %path.display(), records = out.len(), "Read JSON Lines file");
    Ok(out)
}

/// Load a signal feed export.
pub fn read_signals(path: &Path) -> PersistenceResult<Vec<Signal>> {
    read_jsonl(path)
}
