// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Programs the Programmable Interval Timer.
//!
//! The PIT serves two roles here. At boot, channel 2 (the speaker
//! channel, whose gate and output are software-visible) times a fixed
//! window so the TSC rate can be measured. Afterwards, channel 0 runs
//! in rate mode to drive IRQ 0, the scheduler's preemption tick.

use x86_64::instructions::port::Port;

/// The PIT input clock rate in Hz.
///
const PIT_FREQUENCY: u64 = 1_193_182;

/// The length of the calibration window, in milliseconds.
///
const CALIBRATION_MS: u64 = 10;

const CHANNEL_0_DATA: u16 = 0x40;
const CHANNEL_2_DATA: u16 = 0x42;
const MODE_COMMAND: u16 = 0x43;
const GATE_CONTROL: u16 = 0x61;

/// Measures the number of TSC ticks in one millisecond.
///
/// Channel 2 counts down a [`CALIBRATION_MS`] window in
/// one-shot mode while the TSC runs; the window's bounds come
/// from the channel's output pin flipping high. Interrupts
/// must be disabled by the caller.
///
pub(super) fn measure_tsc_per_ms() -> u64 {
    let count = (PIT_FREQUENCY * CALIBRATION_MS / 1000) as u16;

    unsafe {
        // Raise the channel-2 gate with the speaker muted.
        let mut gate: Port<u8> = Port::new(GATE_CONTROL);
        let previous = gate.read();
        gate.write((previous & !0x02) | 0x01);

        // Channel 2, lobyte/hibyte, mode 0 (interrupt on
        // terminal count: the output pin goes high once the
        // count expires).
        let mut command: Port<u8> = Port::new(MODE_COMMAND);
        command.write(0xb0u8);

        let mut data: Port<u8> = Port::new(CHANNEL_2_DATA);
        data.write((count & 0xff) as u8);
        data.write((count >> 8) as u8);

        let start = core::arch::x86_64::_rdtsc();
        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        let end = core::arch::x86_64::_rdtsc();

        // Restore the gate register.
        gate.write(previous);

        (end - start) / CALIBRATION_MS
    }
}

/// Starts channel 0 in rate mode at `freq` Hz, driving IRQ 0.
///
pub(super) fn start_periodic(freq: u64) {
    let divisor = (PIT_FREQUENCY / freq).clamp(1, 65535);

    unsafe {
        // Channel 0, lobyte/hibyte, mode 2 (rate generator).
        let mut command: Port<u8> = Port::new(MODE_COMMAND);
        command.write(0x34u8);

        let mut data: Port<u8> = Port::new(CHANNEL_0_DATA);
        data.write((divisor & 0xff) as u8);
        data.write((divisor >> 8) as u8);
    }
}
