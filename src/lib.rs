//! In-process cycle-counter telemetry for hot paths.
//!
//! Wrap a code region in [`Fast::start`]/[`Fast::stop`] (or `Mid`/`Hard`
//! for stronger instruction-ordering guarantees), or drop a
//! [`pulse!`] into a loop body, and every execution lands as one cycle
//! count in a per-thread ring buffer. Nothing on that path locks,
//! allocates (after first use), hashes a string, or touches shared
//! state. At a quiescent point, [`dump`] renders per-component
//! statistics, optionally subtracting the library's own measured
//! overhead per (start, stop) mode pair.
//!
//! Identifiers are `&'static str` compared by address: use string
//! literals or `static` items and present the same one for the same
//! site for the life of the process.
//!
//! Recording while another thread dumps is undefined; quiesce first.
//! The library never pins threads. On hardware without an invariant
//! counter, pin instrumented threads yourself or deltas spanning a core
//! migration are discarded.

mod calibrate;
mod clean;
mod error;
mod manager;
mod pulse;
mod recorder;
mod report;
mod ring;
mod stats;
mod storage;
mod tsc;

pub use error::Error;
pub use pulse::Pulse;
pub use recorder::{Recorder, Span};
pub use report::{dump, dump_json, format_cycles, format_time, Samples, Unit};
pub use ring::RING_CAPACITY;
pub use stats::Summary;
pub use storage::MAX_ACTIVE_SLOTS;
pub use tsc::{Fenced, Mode, Serializing, TimeSource, Unordered};

/// Raw counter ticks.
pub type Cycles = u64;

/// Start/stop recording with the unordered counter read. Cheapest; the
/// CPU may reorder neighboring instructions into or out of the measured
/// region.
pub type Fast = Recorder<Unordered>;

/// Start/stop recording with a serializing counter read.
pub type Mid = Recorder<Serializing>;

/// Start/stop recording behind a load-serializing barrier. Dearest, but
/// speculation cannot leak across the measurement boundary.
pub type Hard = Recorder<Fenced>;

/// Force the one-shot self-calibration now instead of at the first dump.
/// Idempotent and thread-safe; concurrent callers block until the first
/// one finishes. Takes a little over 100 ms of wall time.
pub fn calibrate() {
    manager::manager().ensure_calibrated();
}

/// Every raw cycle sample recorded for `id` across all threads.
///
/// Matching is by address: pass the same `&'static str` item that the
/// instrumentation sites use. Must not race with active recording.
pub fn snapshot(id: &'static str) -> Vec<Cycles> {
    manager::manager().extract_raw(id)
}
