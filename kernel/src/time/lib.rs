// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's monotonic clock.
//!
//! [`now_ns`] reads the invariant [TSC](https://en.wikipedia.org/wiki/Time_Stamp_Counter)
//! and scales it into nanoseconds. The scaling factor is measured once
//! at boot by [`init`], which times a fixed window of the
//! [Programmable Interval Timer](https://en.wikipedia.org/wiki/Programmable_interval_timer)
//! against the TSC; after that the factor is fixed configuration.
//! Before calibration a conservative default is assumed for the boot
//! CPU, so early log lines still carry plausible timestamps.
//!
//! [`init`] also programs the PIT to fire IRQ 0 at
//! [`TICKS_PER_SECOND`] Hz, which is the scheduler's preemption
//! source.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

mod pit;

pub use core::time::Duration;

use core::sync::atomic::{AtomicU64, Ordering};
use log::info;

/// The rate at which the PIT fires the scheduler's timer
/// interrupt.
///
pub const TICKS_PER_SECOND: u64 = 1000;

/// The TSC rate assumed before calibration has run, in ticks
/// per millisecond. This matches a 3.6 GHz boot CPU.
///
const DEFAULT_TSC_PER_MS: u64 = 3_600_000;

/// The number of TSC ticks per millisecond, measured by
/// [`init`].
///
static TSC_PER_MS: AtomicU64 = AtomicU64::new(DEFAULT_TSC_PER_MS);

/// Calibrates the TSC against the PIT and starts the periodic
/// scheduler tick.
///
/// Must run with interrupts disabled: the calibration polls
/// the PIT gate and an interrupt in the middle would stretch
/// the measured window.
///
pub fn init() {
    let measured = pit::measure_tsc_per_ms();
    TSC_PER_MS.store(measured, Ordering::Relaxed);
    info!(
        "TSC calibrated: {}.{:03} GHz",
        measured / 1_000_000,
        (measured / 1_000) % 1_000
    );

    pit::start_periodic(TICKS_PER_SECOND);
}

/// Returns the number of nanoseconds since the TSC was reset,
/// which for practical purposes is since power-on.
///
pub fn now_ns() -> u64 {
    let tsc = unsafe { core::arch::x86_64::_rdtsc() };
    ns_from_tsc(tsc, TSC_PER_MS.load(Ordering::Relaxed))
}

/// Returns the deadline `duration` from now, in nanoseconds.
///
pub fn deadline_after(duration: Duration) -> u64 {
    now_ns().saturating_add(duration.as_nanos() as u64)
}

/// Scales a raw TSC value into nanoseconds using the given
/// ticks-per-millisecond factor.
///
const fn ns_from_tsc(tsc: u64, tsc_per_ms: u64) -> u64 {
    // The intermediate product can exceed 64 bits for large
    // uptimes, so widen before dividing.
    ((tsc as u128 * 1_000_000) / tsc_per_ms as u128) as u64
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn test_ns_from_tsc() {
        // One millisecond of ticks is one million nanoseconds.
        assert_eq!(ns_from_tsc(3_600_000, 3_600_000), 1_000_000);

        // One second at 3.6 GHz.
        assert_eq!(ns_from_tsc(3_600_000_000, 3_600_000), 1_000_000_000);

        // Large uptimes must not overflow: ~54 years of ticks
        // at 3.6 GHz.
        let huge = 3_600_000_000u64 * 86_400 * 365 * 54;
        assert_eq!(ns_from_tsc(huge, 3_600_000), huge / 36 * 10);
    }

    #[test]
    fn test_now_monotonic() {
        // The raw counter only moves forwards.
        let a = now_ns();
        let b = now_ns();
        let c = now_ns();
        assert!(a <= b && b <= c);
    }

    #[test]
    fn test_deadline_after() {
        let before = now_ns();
        let deadline = deadline_after(Duration::from_millis(50));
        assert!(deadline >= before + 50_000_000);
    }
}
