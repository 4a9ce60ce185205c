//! One-shot self-calibration.
//!
//! Two measurements run once per process, on whichever thread first
//! forces them:
//!
//! 1. **cycles_per_ns**: the counter and a monotonic wall clock are
//!    sampled around a 100 ms sleep; the ratio converts cycle deltas to
//!    time in reports.
//! 2. **Overhead table**: for every (start mode, stop mode) permutation
//!    an empty instrumented pair runs enough times to fill a ring, each
//!    iteration bracketed by load-serializing barriers so consecutive
//!    pairs cannot interleave. The pulse primitive gets the same
//!    treatment, wrapped in a Fast pair. The per-permutation offset is
//!    the bucketed minimum median of the recorded samples: the true
//!    instrumentation cost is the floor of the distribution, noise is
//!    additive and one-sided, so per-bucket minima reject isolated
//!    preemption and the median across buckets rejects contiguous
//!    bursts.
//!
//! The calibration identifiers are erased from the measuring thread's
//! map afterwards so they never show up in snapshots or reports.

use std::time::{Duration, Instant};

use crate::manager::Calibration;
use crate::recorder::Recorder;
use crate::ring::{KEY_PULSE, RING_CAPACITY};
use crate::storage::with_storage;
use crate::tsc::{self, calib_key, Fenced, Mode, Serializing, TimeSource, Unordered};
use crate::{Cycles, Pulse};

/// Measurement rounds per permutation: exactly one ring of samples, plus
/// warm-up rounds that the ring wrap discards on its own.
const CAL_ROUNDS: usize = RING_CAPACITY;
const CAL_WARMUP: usize = 1_000;

/// Bucket width for the minimum-median reduction.
const BUMED_BUCKET: usize = 1_000;

/// Reserved identifiers, one per (start, stop) permutation in key order.
static CAL_PAIR_IDS: [&str; 9] = [
    "__metronome_cal_fast_fast",
    "__metronome_cal_fast_mid",
    "__metronome_cal_fast_hard",
    "__metronome_cal_mid_fast",
    "__metronome_cal_mid_mid",
    "__metronome_cal_mid_hard",
    "__metronome_cal_hard_fast",
    "__metronome_cal_hard_mid",
    "__metronome_cal_hard_hard",
];
static CAL_PULSE_PAIR_ID: &str = "__metronome_cal_pulse_pair";
static CAL_PULSE_ID: &str = "__metronome_cal_pulse";

/// Entry point used by the manager's one-shot latch.
pub(crate) fn run() -> Calibration {
    let (cycles_per_ns, clock_fallback) = measure_cycles_per_ns();

    let mut offsets = [0 as Cycles; 10];
    let mut valid = [false; 10];

    for start in [Mode::Fast, Mode::Mid, Mode::Hard] {
        for stop in [Mode::Fast, Mode::Mid, Mode::Hard] {
            let key = calib_key(start, stop) as usize;
            let id = CAL_PAIR_IDS[key];
            run_pair_rounds(start, stop, id);
            if let Some(offset) = bumed(&take_samples(id)) {
                offsets[key] = offset;
                valid[key] = true;
            }
        }
    }

    run_pulse_rounds();
    if let Some(offset) = bumed(&take_samples(CAL_PULSE_PAIR_ID)) {
        offsets[KEY_PULSE as usize] = offset;
        valid[KEY_PULSE as usize] = true;
    }

    erase_calibration_ids();

    Calibration {
        cycles_per_ns,
        offsets,
        valid,
        clock_fallback,
    }
}

/// Counter ticks per nanosecond from a wall-clock bracket around a
/// 100 ms sleep. Returns (ratio, fallback-flag).
fn measure_cycles_per_ns() -> (f64, bool) {
    let wall = Instant::now();
    let c0 = Unordered::now();
    std::thread::sleep(Duration::from_millis(100));
    let c1 = Unordered::now();
    let elapsed_ns = wall.elapsed().as_nanos() as f64;

    if elapsed_ns <= 0.0 || c1 <= c0 {
        log::warn!(
            "metronome: wall clock unusable for calibration (elapsed {elapsed_ns} ns); \
             time-mode reports will use 1 cycle = 1 ns"
        );
        return (1.0, true);
    }
    ((c1 - c0) as f64 / elapsed_ns, false)
}

/// One permutation's measurement loop: an empty instrumented pair,
/// barrier-bracketed per iteration.
fn pair_rounds<S: TimeSource, E: TimeSource>(id: &'static str) {
    for _ in 0..CAL_WARMUP + CAL_ROUNDS {
        tsc::barrier();
        Recorder::<S>::start(id);
        Recorder::<E>::stop(id);
        tsc::barrier();
    }
}

/// Dispatch the runtime (start, stop) pair onto the matching
/// monomorphized loop.
fn run_pair_rounds(start: Mode, stop: Mode, id: &'static str) {
    use Mode::*;
    match (start, stop) {
        (Fast, Fast) => pair_rounds::<Unordered, Unordered>(id),
        (Fast, Mid) => pair_rounds::<Unordered, Serializing>(id),
        (Fast, Hard) => pair_rounds::<Unordered, Fenced>(id),
        (Mid, Fast) => pair_rounds::<Serializing, Unordered>(id),
        (Mid, Mid) => pair_rounds::<Serializing, Serializing>(id),
        (Mid, Hard) => pair_rounds::<Serializing, Fenced>(id),
        (Hard, Fast) => pair_rounds::<Fenced, Unordered>(id),
        (Hard, Mid) => pair_rounds::<Fenced, Serializing>(id),
        (Hard, Hard) => pair_rounds::<Fenced, Fenced>(id),
    }
}

/// Pulse overhead: a Fast pair wrapping exactly one tick per iteration.
/// The first iteration takes the pulse baseline and map insert; the
/// bucketed minimum median ignores that outlier.
fn run_pulse_rounds() {
    let mut pulse = Pulse::new(CAL_PULSE_ID);
    for _ in 0..CAL_WARMUP + CAL_ROUNDS {
        tsc::barrier();
        Recorder::<Unordered>::start(CAL_PULSE_PAIR_ID);
        pulse.tick();
        Recorder::<Unordered>::stop(CAL_PULSE_PAIR_ID);
        tsc::barrier();
    }
}

/// The calibrating thread's own samples for `id`, oldest first.
fn take_samples(id: &'static str) -> Vec<Cycles> {
    with_storage(|ts| {
        ts.rings
            .get(&(id.as_ptr() as usize))
            .map(|entry| entry.ring.collect())
            .unwrap_or_default()
    })
}

fn erase_calibration_ids() {
    with_storage(|ts| {
        for id in CAL_PAIR_IDS
            .iter()
            .chain([CAL_PULSE_PAIR_ID, CAL_PULSE_ID].iter())
        {
            ts.rings.remove(&(id.as_ptr() as usize));
        }
    });
}

/// Bucketed minimum median: split into fixed-width buckets of
/// consecutive samples (dropping a short tail), take each bucket's
/// non-zero minimum, return the median of those minima. With no full
/// bucket, fall back to the global minimum. Returns `None` only for
/// empty (or all-zero) input.
fn bumed(samples: &[Cycles]) -> Option<Cycles> {
    let mut minima: Vec<Cycles> = samples
        .chunks_exact(BUMED_BUCKET)
        .filter_map(|bucket| bucket.iter().copied().filter(|&v| v != 0).min())
        .collect();

    if minima.is_empty() {
        return samples.iter().copied().filter(|&v| v != 0).min();
    }

    minima.sort_unstable();
    let n = minima.len();
    if n % 2 == 1 {
        Some(minima[n / 2])
    } else {
        // Integer-rounded mean of the two middle values; widened so the
        // sum cannot overflow u64.
        let a = minima[n / 2 - 1] as u128;
        let b = minima[n / 2] as u128;
        Some(((a + b + 1) / 2) as Cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumed_of_empty_is_none() {
        assert_eq!(bumed(&[]), None);
    }

    #[test]
    fn bumed_short_input_is_global_minimum() {
        // 999 samples: no full bucket.
        let samples: Vec<Cycles> = (1..1_000).rev().collect();
        assert_eq!(bumed(&samples), Some(1));
    }

    #[test]
    fn bumed_rejects_single_bucket_spike() {
        // Three buckets with floors 50, 50, 50; one bucket polluted by a
        // large preemption spike that must not surface.
        let mut samples = vec![50 as Cycles; 3_000];
        samples[1_500] = 1_000_000;
        assert_eq!(bumed(&samples), Some(50));
    }

    #[test]
    fn bumed_median_rejects_burst_bucket() {
        // One whole bucket elevated (contiguous noise burst); the median
        // of minima ignores it.
        let mut samples = vec![60 as Cycles; 5_000];
        for s in samples.iter_mut().take(2_000).skip(1_000) {
            *s = 9_000;
        }
        assert_eq!(bumed(&samples), Some(60));
    }

    #[test]
    fn bumed_even_count_rounds_the_middle_pair() {
        // Two buckets with minima 10 and 21 -> rounded mean 16.
        let mut samples = vec![100 as Cycles; 2_000];
        samples[5] = 10;
        samples[1_005] = 21;
        assert_eq!(bumed(&samples), Some(16));
    }

    #[test]
    fn bumed_drops_short_tail_bucket() {
        // 1_500 samples: one full bucket (floor 40) plus a 500-sample
        // tail with a lower floor that must be ignored.
        let mut samples = vec![40 as Cycles; 1_500];
        samples[1_400] = 1;
        assert_eq!(bumed(&samples), Some(40));
    }

    #[test]
    fn bumed_filters_zeros_inside_buckets() {
        let mut samples = vec![0 as Cycles; 1_000];
        samples[500] = 30;
        assert_eq!(bumed(&samples), Some(30));
    }
}
