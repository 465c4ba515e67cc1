// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides access to the serial ports and implements the `print` and
//! `println` macros.
//!
//! The kernel's debug log is written to the first serial port, [`COM1`],
//! which QEMU and most virtual machine monitors forward to the host.
//! Each port is protected with a spin lock.
//!
//! # Safety
//!
//! The [`print`] and [`println`] macros disable interrupts while they
//! run, to prevent deadlocks when an interrupt handler logs while the
//! caller holds the [`COM1`] lock.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

use core::fmt::Write;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;

/// COM1 is the first serial port device.
///
pub static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x3f8) });

/// COM2 is the second serial port device.
///
pub static COM2: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x2f8) });

/// Initialises the first serial port.
///
pub fn init() {
    without_interrupts(|| {
        COM1.lock().init();
    });
}

/// _print writes text to the serial port by
/// acquiring COM1 using a spin lock.
///
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    without_interrupts(|| {
        COM1.lock()
            .write_fmt(args)
            .expect("Printing to COM1 failed");
    });
}

/// Print to the first serial port, COM1.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Print to the first serial port, COM1.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
