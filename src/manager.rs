//! Process-wide registry of thread storages and the calibration latch.
//!
//! The manager sees no hot-path traffic: threads touch it exactly once,
//! when their storage is created. Everything else it does (calibration,
//! extraction, the dump walk) happens at quiescent points under its
//! lock.

use std::sync::{Arc, Mutex, OnceLock};

use crate::ring::{KEY_MIXED, KEY_UNSET};
use crate::storage::StorageCell;
use crate::Cycles;

/// Output of the one-shot self-calibration.
pub struct Calibration {
    /// Counter ticks per wall-clock nanosecond. Always > 0; falls back to
    /// 1.0 when the wall clock could not be measured.
    pub cycles_per_ns: f64,
    /// Measured instrumentation overhead per calibration key: nine
    /// (start mode, stop mode) permutations plus the pulse slot.
    pub offsets: [Cycles; 10],
    /// Whether the matching offset was actually measured.
    pub valid: [bool; 10],
    /// True when `cycles_per_ns` is the 1.0 fallback; time-mode reports
    /// flag themselves as running on an uncalibrated clock.
    pub clock_fallback: bool,
}

/// Samples extracted for one (id, buffer) during a dump walk.
pub(crate) struct BufferDump {
    pub(crate) name: &'static str,
    pub(crate) addr: usize,
    pub(crate) calib_key: u8,
    pub(crate) samples: Vec<Cycles>,
}

pub struct Manager {
    registry: Mutex<Vec<Arc<StorageCell>>>,
    calibration: OnceLock<Calibration>,
}

/// The process-wide singleton. The registry must outlive every thread
/// that ever recorded, so it is never torn down.
pub fn manager() -> &'static Manager {
    static MANAGER: OnceLock<Manager> = OnceLock::new();
    MANAGER.get_or_init(|| Manager {
        registry: Mutex::new(Vec::new()),
        calibration: OnceLock::new(),
    })
}

impl Manager {
    /// Called once per thread, from the cold storage-creation path.
    pub(crate) fn register(&self, cell: Arc<StorageCell>) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cell);
    }

    /// Run the calibrator at most once per process. Safe to call from
    /// any number of threads; losers block until the winner finishes.
    pub fn ensure_calibrated(&self) -> &Calibration {
        self.calibration.get_or_init(crate::calibrate::run)
    }

    /// Measured overhead for a calibration key, in cycles. Sentinel keys
    /// (unset, mixed) and unmeasured slots subtract nothing.
    pub fn calibration_offset(&self, key: u8) -> Cycles {
        if key == KEY_UNSET || key == KEY_MIXED {
            return 0;
        }
        match self.calibration.get() {
            Some(cal) if (key as usize) < cal.offsets.len() && cal.valid[key as usize] => {
                cal.offsets[key as usize]
            }
            _ => 0,
        }
    }

    /// All non-zero samples recorded for `id` across every registered
    /// thread, oldest-first per thread. The registry lock is held for
    /// the whole scan; callers must have quiesced recording.
    pub fn extract_raw(&self, id: &'static str) -> Vec<Cycles> {
        let addr = id.as_ptr() as usize;
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for cell in registry.iter() {
            // SAFETY: registry lock held, recording quiescent by contract.
            let ts = unsafe { cell.read() };
            if let Some(entry) = ts.rings.get(&addr) {
                out.extend(entry.ring.collect());
            }
        }
        out
    }

    /// Walk every registered buffer for the report. One `BufferDump` per
    /// (thread, id) pair; the caller merges by id after per-buffer
    /// offset subtraction.
    pub(crate) fn collect_buffers(&self) -> Vec<BufferDump> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for cell in registry.iter() {
            // SAFETY: registry lock held, recording quiescent by contract.
            let ts = unsafe { cell.read() };
            for (&addr, entry) in ts.rings.iter() {
                out.push(BufferDump {
                    name: entry.name,
                    addr,
                    calib_key: entry.ring.calib_key(),
                    samples: entry.ring.collect(),
                });
            }
        }
        out
    }
}
