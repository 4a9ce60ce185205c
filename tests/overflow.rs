//! Ring overwrite semantics through the public API: the buffer retains
//! exactly the newest capacity-many samples.

use std::sync::{Mutex, MutexGuard};

use metronome::{snapshot, Fast};

static QUIESCE: Mutex<()> = Mutex::new(());

fn quiesced() -> MutexGuard<'static, ()> {
    QUIESCE.lock().unwrap_or_else(|e| e.into_inner())
}

// Keeps the pair long enough that the counter ticks even where it runs
// below the core clock, without dominating the 100k-iteration test.
fn short_busy() {
    for i in 0..200u64 {
        std::hint::black_box(i);
    }
}

#[test]
fn a_hundred_thousand_pairs_keep_one_ring_full() {
    let _q = quiesced();
    static ID: &str = "overflow-wrap";
    for _ in 0..100_000 {
        Fast::start(ID);
        short_busy();
        Fast::stop(ID);
    }
    let samples = snapshot(ID);
    // 2^16 slots, all overwritten at least once.
    assert_eq!(samples.len(), 65_536);
    assert!(samples.iter().all(|&s| s > 0));
}

#[test]
fn under_capacity_keeps_every_sample() {
    let _q = quiesced();
    static ID: &str = "overflow-under";
    for _ in 0..1_000 {
        Fast::start(ID);
        short_busy();
        Fast::stop(ID);
    }
    assert_eq!(snapshot(ID).len(), 1_000);
}
