// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Walks the stack and symbolises the return addresses.
//!
//! The kernel is compiled with frame pointers, so each stack frame
//! starts with the saved `rbp` of its caller, followed by the return
//! address. The walk follows that chain, printing each return address
//! with the function symbol containing it, until the chain ends or
//! stops making sense. The panic handler calls this; it must not
//! allocate.

use core::arch::asm;
use log::error;
use memlayout::VirtAddr;

/// The deepest trace that will be printed.
///
const MAX_FRAMES: usize = 64;

/// Prints the current call stack to the log, most recent frame
/// first.
///
pub fn print_stack_trace() {
    let mut rbp: usize;
    unsafe {
        asm!("mov {}, rbp", out(reg) rbp, options(nostack, nomem, preserves_flags));
    }

    error!("stack trace:");
    for depth in 0..MAX_FRAMES {
        // The chain ends at a zero or misaligned frame pointer.
        if rbp == 0 || rbp % 8 != 0 {
            return;
        }

        let return_addr = unsafe { *((rbp + 8) as *const usize) };
        if return_addr == 0 {
            return;
        }

        match VirtAddr::try_new(return_addr) {
            Ok(addr) => print_frame(depth, addr),
            Err(_) => return,
        }

        rbp = unsafe { *(rbp as *const usize) };
    }

    error!("  ... trace truncated");
}

fn print_frame(depth: usize, addr: VirtAddr) {
    match symbols::lookup(addr) {
        Some((name, start)) => error!(
            "  #{:02} {:#018x} in {}+{:#x}",
            depth,
            addr.as_usize(),
            name,
            addr.as_usize() - start
        ),
        None => error!("  #{:02} {:#018x}", depth, addr.as_usize()),
    }
}
