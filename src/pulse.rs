//! Delta-between-events recording for sites inside tight loops, where no
//! scope exists to bracket. Each call records the cycles elapsed since
//! the previous call at the same site on the same thread.

use std::marker::PhantomData;

use crate::ring::{RingBuffer, KEY_PULSE};
use crate::storage::with_storage;
use crate::tsc::{TimeSource, Unordered};
use crate::Cycles;

/// A per-(thread, id) pulse recorder.
///
/// Construction resolves the ring once and takes the baseline timestamp;
/// it records no sample. Every [`tick`](Pulse::tick) after that pushes
/// the delta since the previous call using the unordered (Fast)
/// timestamp source, with no map lookup.
///
/// The handle caches a pointer into its thread's storage, so it is
/// deliberately `!Send`. For a drop-in call inside a loop body, use the
/// [`pulse!`](crate::pulse!) macro, which keeps one handle per call site
/// per thread.
pub struct Pulse {
    ring: *mut RingBuffer,
    last: Cycles,
    _not_send: PhantomData<*mut ()>,
}

impl Pulse {
    pub fn new(id: &'static str) -> Pulse {
        let ring = with_storage(|ts| {
            let ring: &mut RingBuffer = ts.ring_for(id);
            ring as *mut RingBuffer
        });
        Pulse {
            ring,
            last: Unordered::now(),
            _not_send: PhantomData,
        }
    }

    /// Record the delta since the previous call and rebase. A zero delta
    /// (counter did not advance) is discarded.
    #[inline(always)]
    pub fn tick(&mut self) {
        let now = Unordered::now();
        let delta = now.saturating_sub(self.last);
        self.last = now;
        if delta != 0 {
            // SAFETY: the ring is boxed inside this thread's storage,
            // which lives until process exit and never moves its heap
            // allocation; the handle is !Send so only the owning thread
            // writes through the pointer.
            unsafe { (*self.ring).push(delta, KEY_PULSE) };
        }
    }
}

/// Record a pulse at this call site.
///
/// Expands to a thread-local [`Pulse`] handle created on the first pass
/// through the site (which records nothing) and ticked on every pass
/// after that. The ring lookup therefore happens exactly once per thread
/// per site.
///
/// ```no_run
/// loop {
///     // hot work...
///     metronome::pulse!("order-loop");
///     # break;
/// }
/// ```
#[macro_export]
macro_rules! pulse {
    ($id:expr) => {{
        ::std::thread_local! {
            static __METRONOME_PULSE: ::std::cell::RefCell<::std::option::Option<$crate::Pulse>> =
                const { ::std::cell::RefCell::new(::std::option::Option::None) };
        }
        __METRONOME_PULSE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                ::std::option::Option::Some(p) => p.tick(),
                ::std::option::Option::None => {
                    *slot = ::std::option::Option::Some($crate::Pulse::new($id));
                }
            }
        });
    }};
}
