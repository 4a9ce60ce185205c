//! Cycle-counter readers at three serialization strengths.
//!
//! `Unordered` is a bare counter read (`rdtsc` on x86_64, `cntvct_el0` on
//! aarch64) and costs the least; the CPU is free to reorder surrounding
//! instructions across it. `Serializing` waits for prior instructions to
//! retire on at least one side of the read (`rdtscp`; synthesized with
//! `isb` on aarch64, which has no serializing counter variant).
//! `Fenced` additionally places a load-serializing barrier in front of
//! the read so speculative execution cannot cross the boundary.
//!
//! All three return raw counter ticks. There is deliberately no wall-clock
//! fallback: on targets without a user-readable cycle counter this module
//! refuses to compile rather than silently degrade to a coarse clock.

use crate::Cycles;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!(
    "metronome requires a user-readable cycle counter (x86_64 rdtsc or aarch64 cntvct_el0)"
);

/// Serialization strength of a timestamp read. The numeric values feed
/// the calibration-key encoding, so they must stay dense from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Fast = 0,
    Mid = 1,
    Hard = 2,
}

/// Calibration key for a (start mode, stop mode) pair: `3 * start + stop`,
/// in 0..9. Slot 9 is reserved for the pulse primitive.
#[inline(always)]
pub fn calib_key(start: Mode, stop: Mode) -> u8 {
    3 * start as u8 + stop as u8
}

/// A monomorphized timestamp reader. Implementors are zero-sized tags;
/// each instrumentation call site compiles down to the one inline
/// counter-read it asked for.
pub trait TimeSource {
    const MODE: Mode;
    fn now() -> Cycles;
}

/// Unordered counter read.
pub struct Unordered;

/// Serializing counter read (drains retirement before reading).
pub struct Serializing;

/// Load-serializing barrier followed by a serializing read.
pub struct Fenced;

impl TimeSource for Unordered {
    const MODE: Mode = Mode::Fast;

    #[inline(always)]
    fn now() -> Cycles {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: rdtsc is unprivileged and has no memory effects.
        unsafe {
            core::arch::x86_64::_rdtsc()
        }
        #[cfg(target_arch = "aarch64")]
        {
            let val: u64;
            // SAFETY: cntvct_el0 is readable from EL0.
            unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nostack)) };
            val
        }
    }
}

impl TimeSource for Serializing {
    const MODE: Mode = Mode::Mid;

    #[inline(always)]
    fn now() -> Cycles {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: rdtscp is unprivileged; aux (TSC_AUX) is discarded.
        unsafe {
            let mut aux = 0u32;
            core::arch::x86_64::__rdtscp(&mut aux)
        }
        #[cfg(target_arch = "aarch64")]
        {
            let val: u64;
            // isb drains the pipeline before the counter read, matching
            // rdtscp's wait-for-retirement on the front side.
            // SAFETY: both instructions are EL0-legal.
            unsafe {
                core::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) val, options(nostack))
            };
            val
        }
    }
}

impl TimeSource for Fenced {
    const MODE: Mode = Mode::Hard;

    #[inline(always)]
    fn now() -> Cycles {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: lfence and rdtscp are unprivileged.
        unsafe {
            core::arch::x86_64::_mm_lfence();
            let mut aux = 0u32;
            core::arch::x86_64::__rdtscp(&mut aux)
        }
        #[cfg(target_arch = "aarch64")]
        {
            let val: u64;
            // dmb ishld orders prior loads, isb stops speculation past the
            // barrier; together they approximate lfence + rdtscp.
            // SAFETY: all three instructions are EL0-legal.
            unsafe {
                core::arch::asm!(
                    "dmb ishld",
                    "isb",
                    "mrs {}, cntvct_el0",
                    out(reg) val,
                    options(nostack)
                )
            };
            val
        }
    }
}

/// Standalone load-serializing barrier. Calibration brackets each
/// measurement iteration with this so consecutive no-op pairs cannot
/// interleave in the pipeline.
#[inline(always)]
pub fn barrier() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: lfence is unprivileged.
    unsafe {
        core::arch::x86_64::_mm_lfence()
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: isb is EL0-legal.
    unsafe {
        core::arch::asm!("isb", options(nostack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The aarch64 generic counter can tick slower than the core clock, so
    // burn a little work between reads instead of reading back-to-back.
    fn advance_between<F: Fn() -> Cycles>(read: F) {
        let a = read();
        for i in 0..10_000u64 {
            std::hint::black_box(i);
        }
        let b = read();
        assert!(b > a, "counter failed to advance ({a} vs {b})");
    }

    #[test]
    fn counters_advance() {
        advance_between(Unordered::now);
        advance_between(Serializing::now);
        advance_between(Fenced::now);
    }

    #[test]
    fn calib_keys_are_dense() {
        use Mode::*;
        let mut seen = [false; 9];
        for s in [Fast, Mid, Hard] {
            for e in [Fast, Mid, Hard] {
                seen[calib_key(s, e) as usize] = true;
            }
        }
        assert!(seen.iter().all(|&v| v));
        assert_eq!(calib_key(Fast, Hard), 2);
        assert_eq!(calib_key(Hard, Fast), 6);
    }
}
