//! The start/stop recording engine.
//!
//! `Recorder<S>` monomorphizes over a timestamp source, so each of the
//! three public flavors compiles to exactly one inline counter read plus
//! a handful of thread-local stores. The ordering inside `stop` is the
//! load-bearing part: the timestamp is taken before any bookkeeping so
//! the map lookup and ring write sit outside the measured window.

use std::marker::PhantomData;

use crate::storage::with_storage;
use crate::tsc::{calib_key, TimeSource};

/// Start/stop recording over timestamp source `S`.
///
/// Identifiers are matched by address, not contents: pass string
/// literals or `static` items, and reuse the same item for the same
/// logical site. The id handed to [`stop`](Recorder::stop) is advisory
/// only; the sample is always accounted to the innermost open scope,
/// which keeps the stack consistent even when callers mislabel a stop.
pub struct Recorder<S: TimeSource> {
    _source: PhantomData<S>,
}

impl<S: TimeSource> Recorder<S> {
    /// Open a scope for `id`. Scopes nest strictly (LIFO); a scope opened
    /// past the depth limit is dropped and records nothing.
    #[inline(always)]
    pub fn start(id: &'static str) {
        with_storage(|ts| {
            // Storage access happens before the read so TLS cost stays
            // outside the measured window.
            let t = S::now();
            ts.push_scope(id, t, S::MODE);
        });
    }

    /// Close the innermost open scope and record its duration.
    ///
    /// A stop with no open scope is a no-op. A delta of zero (the
    /// counter failed to advance, e.g. core migration on non-invariant
    /// hardware) is discarded rather than stored.
    #[inline(always)]
    pub fn stop(_id: &'static str) {
        let t = S::now();
        with_storage(|ts| {
            if let Some((open_id, t0, start_mode)) = ts.pop_scope() {
                let delta = t.saturating_sub(t0);
                if delta != 0 {
                    let key = calib_key(start_mode, S::MODE);
                    ts.ring_for(open_id).push(delta, key);
                }
            }
        });
    }

    /// Open a scope that closes itself when the guard drops, on any exit
    /// path including unwinding.
    #[inline]
    pub fn span(id: &'static str) -> Span<S> {
        Self::start(id);
        Span {
            id,
            _not_send: PhantomData,
        }
    }
}

/// RAII guard returned by [`Recorder::span`]. Tied to the thread that
/// opened it; the scope stack it closes is thread-local.
#[must_use = "dropping the span immediately records a near-zero duration; bind it with `let _span = ...`"]
pub struct Span<S: TimeSource> {
    id: &'static str,
    // Keep the guard on its creating thread; the pushed scope lives in
    // that thread's stack.
    _not_send: PhantomData<(*mut (), S)>,
}

impl<S: TimeSource> Drop for Span<S> {
    #[inline]
    fn drop(&mut self) {
        Recorder::<S>::stop(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::KEY_MIXED;
    use crate::tsc::{calib_key, Fenced, Mode, Serializing, Unordered};
    use crate::{Fast, Hard, Mid};

    fn tag_of(id: &'static str) -> u8 {
        with_storage(|ts| ts.ring_for(id).calib_key())
    }

    // Enough work for the counter to tick even on aarch64 parts where it
    // runs far below the core clock.
    fn busy() {
        for i in 0..2_000u64 {
            std::hint::black_box(i);
        }
    }

    fn samples_of(id: &'static str) -> Vec<crate::Cycles> {
        with_storage(|ts| ts.ring_for(id).collect())
    }

    #[test]
    fn one_pair_one_sample() {
        static ID: &str = "recorder-single-pair";
        Fast::start(ID);
        busy();
        Fast::stop(ID);
        let samples = samples_of(ID);
        assert_eq!(samples.len(), 1);
        assert!(samples[0] > 0);
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        static ID: &str = "recorder-unmatched-stop";
        Hard::stop(ID);
        with_storage(|ts| {
            assert!(!ts.rings.contains_key(&(ID.as_ptr() as usize)));
        });
    }

    #[test]
    fn mixed_mode_pair_keys_then_mixes() {
        static ID: &str = "recorder-mixed-mode";
        Fast::start(ID);
        busy();
        Hard::stop(ID);
        assert_eq!(tag_of(ID), calib_key(Mode::Fast, Mode::Hard));

        Mid::start(ID);
        busy();
        Hard::stop(ID);
        assert_eq!(tag_of(ID), KEY_MIXED);
    }

    #[test]
    fn stop_id_is_advisory() {
        // A mislabeled stop accounts to the innermost open scope.
        static OUTER: &str = "recorder-advisory-outer";
        static WRONG: &str = "recorder-advisory-wrong";
        Mid::start(OUTER);
        busy();
        Mid::stop(WRONG);
        assert_eq!(samples_of(OUTER).len(), 1);
        with_storage(|ts| {
            assert!(!ts.rings.contains_key(&(WRONG.as_ptr() as usize)));
        });
    }

    #[test]
    fn span_records_on_drop_and_on_unwind() {
        static ID: &str = "recorder-span-drop";
        {
            let _span = Fast::span(ID);
            busy();
        }
        assert_eq!(samples_of(ID).len(), 1);

        static PANIC_ID: &str = "recorder-span-unwind";
        let result = std::panic::catch_unwind(|| {
            let _span = Fast::span(PANIC_ID);
            busy();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(samples_of(PANIC_ID).len(), 1);
    }

    #[test]
    fn every_source_records() {
        static F: &str = "recorder-src-f";
        static M: &str = "recorder-src-m";
        static H: &str = "recorder-src-h";
        Recorder::<Unordered>::start(F);
        busy();
        Recorder::<Unordered>::stop(F);
        Recorder::<Serializing>::start(M);
        busy();
        Recorder::<Serializing>::stop(M);
        Recorder::<Fenced>::start(H);
        busy();
        Recorder::<Fenced>::stop(H);
        assert_eq!(samples_of(F).len(), 1);
        assert_eq!(samples_of(M).len(), 1);
        assert_eq!(samples_of(H).len(), 1);
    }
}
