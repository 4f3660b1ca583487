//! Signal intake.
//!
//! - `SignalIntake`: status, instrument, staleness and confidence filters
//! - `fingerprint`: BLAKE3 digest identifying one version of a signal
//! - `DedupCache`: sliding-window claim table keyed by fingerprint

pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod intake;

pub use dedup::DedupCache;
pub use error::{IntakeError, IntakeResult};
pub use fingerprint::fingerprint;
pub use intake::{IntakeConfig, SignalIntake};
