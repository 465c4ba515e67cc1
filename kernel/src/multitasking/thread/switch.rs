// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The assembly side of the context switch.

use core::arch::global_asm;

global_asm!(include_str!("switch.s"));

extern "C" {
    /// The routine installed on vector 32.
    ///
    /// It saves the interrupted thread's registers around the
    /// hardware stack frame, calls `switch_context` with a
    /// pointer to the saved state, and returns into whichever
    /// thread's state `switch_context` leaves on the stack.
    ///
    /// Declared only so its address can be installed in the
    /// IDT; it must never be called from Rust.
    ///
    pub fn timer_interrupt_entry();
}
