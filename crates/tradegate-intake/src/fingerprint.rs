//! Signal fingerprints.
//!
//! Two observations of a signal share a fingerprint iff they agree on
//! instrument, timeframe, direction, confidence (2 dp), entry price (at the
//! instrument's precision), id and creation time. An updated signal gets a
//! new fingerprint and is evaluated again.

use tradegate_core::{InstrumentSpec, Signal};

/// Hex BLAKE3 digest of the signal's canonical rendering.
pub fn fingerprint(signal: &Signal, spec: &InstrumentSpec) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        signal.instrument,
        signal.timeframe,
        signal.direction,
        signal.confidence.round_dp(2).normalize(),
        spec.round_price(signal.entry_price).inner().normalize(),
        signal.id,
        signal.created_at_ms,
    );
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}
