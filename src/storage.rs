//! Per-thread recording state: the active-scope stack and the id→ring map.
//!
//! Each thread lazily creates one `ThreadStorage` on its first
//! instrumentation call and registers it with the process-wide manager.
//! The storage is single-writer for the thread's whole lifetime: the hot
//! path takes `&mut` through a thread-local, with no lock. The manager
//! reads it only while the registry lock is held and the caller has
//! quiesced all recording (dumping while recording is undefined, by
//! contract). `StorageCell` encodes exactly that bargain: an
//! `UnsafeCell` whose `Sync` impl is justified by the quiesce contract,
//! the same shape firestorm-style event logs use for their thread-local
//! buffers.
//!
//! Identifiers are `&'static str` compared **by address**, never by
//! contents. The map is keyed on the pointer value with an Fx hash (a
//! single multiply of a usize); no string hashing or comparison happens
//! on the stop path.

use std::cell::UnsafeCell;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::ring::RingBuffer;
use crate::tsc::Mode;
use crate::Cycles;

/// Maximum depth of concurrently open scopes per thread. A start call
/// beyond this depth is silently dropped and its matching stop becomes a
/// no-op on an empty-enough stack.
pub const MAX_ACTIVE_SLOTS: usize = 64;

/// One measurement site's buffer plus the display name for reports.
pub(crate) struct IdRing {
    pub(crate) name: &'static str,
    pub(crate) ring: Box<RingBuffer>,
}

pub struct ThreadStorage {
    // Parallel arrays for the scope stack: one cache-friendly lane per
    // field instead of an array of wide tuples.
    stack_ids: [&'static str; MAX_ACTIVE_SLOTS],
    stack_starts: [Cycles; MAX_ACTIVE_SLOTS],
    stack_modes: [Mode; MAX_ACTIVE_SLOTS],
    stack_top: usize,
    pub(crate) rings: FxHashMap<usize, IdRing>,
}

/// Marks the rarely-taken side of a hot-path branch so the optimizer
/// lays it out off the fall-through path.
#[cold]
#[inline(never)]
fn cold() {}

impl ThreadStorage {
    fn new() -> Self {
        ThreadStorage {
            stack_ids: [""; MAX_ACTIVE_SLOTS],
            stack_starts: [0; MAX_ACTIVE_SLOTS],
            stack_modes: [Mode::Fast; MAX_ACTIVE_SLOTS],
            stack_top: 0,
            rings: FxHashMap::default(),
        }
    }

    /// Open a scope. A full stack drops the scope: no slot is written and
    /// the matching stop will account to whatever is on top instead.
    #[inline(always)]
    pub fn push_scope(&mut self, id: &'static str, start: Cycles, mode: Mode) {
        if self.stack_top >= MAX_ACTIVE_SLOTS {
            cold();
            return;
        }
        self.stack_ids[self.stack_top] = id;
        self.stack_starts[self.stack_top] = start;
        self.stack_modes[self.stack_top] = mode;
        self.stack_top += 1;
    }

    /// Close the innermost open scope, if any.
    #[inline(always)]
    pub fn pop_scope(&mut self) -> Option<(&'static str, Cycles, Mode)> {
        if self.stack_top == 0 {
            cold();
            return None;
        }
        self.stack_top -= 1;
        Some((
            self.stack_ids[self.stack_top],
            self.stack_starts[self.stack_top],
            self.stack_modes[self.stack_top],
        ))
    }

    #[cfg(test)]
    pub(crate) fn stack_depth(&self) -> usize {
        self.stack_top
    }

    /// The ring for `id`, inserting on first use. The insert allocates
    /// and is the one cold cost per (thread, id); pre-touch ids at
    /// startup if even that is unacceptable.
    #[inline(always)]
    pub fn ring_for(&mut self, id: &'static str) -> &mut RingBuffer {
        let addr = id.as_ptr() as usize;
        match self.rings.entry(addr) {
            Entry::Occupied(e) => &mut e.into_mut().ring,
            Entry::Vacant(e) => {
                cold();
                &mut e
                    .insert(IdRing {
                        name: id,
                        ring: RingBuffer::boxed(),
                    })
                    .ring
            }
        }
    }
}

/// Single-writer cell holding one thread's storage.
///
/// The owning thread mutates through [`with_storage`] on the hot path.
/// Any other access goes through the manager while its lock is held and
/// recording is quiescent.
pub struct StorageCell(UnsafeCell<ThreadStorage>);

// SAFETY: the cell is written only by its owning thread. Cross-thread
// reads happen solely under the manager lock at dump/extract time, when
// the user contract guarantees no recording is in flight. Concurrent
// dump-while-recording is documented as undefined.
unsafe impl Sync for StorageCell {}
// SAFETY: the Arc holding the cell is shared with the registry at
// creation; the cell itself never migrates ownership.
unsafe impl Send for StorageCell {}

impl StorageCell {
    /// Read access for the manager's extraction paths.
    ///
    /// # Safety
    /// The caller must hold the manager registry lock and the owning
    /// thread must not be recording.
    pub(crate) unsafe fn read(&self) -> &ThreadStorage {
        &*self.0.get()
    }
}

thread_local! {
    static STORAGE: Arc<StorageCell> = init_storage();
}

#[cold]
#[inline(never)]
fn init_storage() -> Arc<StorageCell> {
    let cell = Arc::new(StorageCell(UnsafeCell::new(ThreadStorage::new())));
    crate::manager::manager().register(Arc::clone(&cell));
    log::debug!("metronome: registered storage for {:?}", std::thread::current().id());
    cell
}

/// Run `f` with exclusive access to the calling thread's storage.
///
/// Not reentrant: `f` must not call back into `with_storage` (nothing in
/// this crate does).
#[inline(always)]
pub fn with_storage<R>(f: impl FnOnce(&mut ThreadStorage) -> R) -> R {
    STORAGE.with(|cell| {
        // SAFETY: this is the owning thread and with_storage is never
        // nested, so the &mut is unique. See StorageCell.
        f(unsafe { &mut *cell.0.get() })
    })
}
