// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Handles the [Interrupt Descriptor Table](https://en.wikipedia.org/wiki/Interrupt_descriptor_table) (IDT),
//! CPU exceptions, and the [Programmable Interrupt Controller](https://en.wikipedia.org/wiki/Programmable_interrupt_controller) (PIC).
//!
//! [`init`] installs the full 256-entry IDT: every architecturally
//! defined exception (vectors 0-21 and 28-30) gets a dedicated
//! trap-gate handler that logs, dumps the interrupt stack frame and
//! panics, and every remaining vector gets a default no-op
//! interrupt-gate handler. Vector 32 is reserved for the scheduler
//! timer.
//!
//! Drivers claim vectors at or above 32 with [`set_isr`] (or
//! [`set_isr_raw`] for handlers written in assembly), release them
//! with [`clear_isr`], and query them with [`contains_isr`]. A vector
//! can only be claimed while it holds the default handler.
//!
//! Short critical sections are bracketed with [`Guard`], which
//! disables interrupts for its scope and restores the previous state
//! on exit.

#![no_std]
#![feature(abi_x86_interrupt)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

mod exceptions;
mod guard;
pub mod pic;

pub use crate::guard::Guard;

use lazy_static::lazy_static;
use memlayout::VirtAddr;
use spin::Mutex;
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;

/// The vector reserved for the scheduler timer interrupt.
///
pub const TIMER_VECTOR: u8 = 32;

/// The number of vectors the IDT covers.
///
const NUM_VECTORS: usize = 256;

/// The first vector that can be claimed with [`set_isr`].
/// Everything below it belongs to CPU exceptions.
///
const FIRST_FREE_VECTOR: u8 = 32;

/// The fixed code-segment selector the boot shim installs for
/// the kernel.
///
const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// The stack frame the CPU pushes when it delivers an
/// interrupt.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct StackFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// An interrupt service routine taking no error code.
///
pub type Isr = extern "x86-interrupt" fn(StackFrame);

/// Writes the hardware stack frame to the log, one register
/// pair per line.
///
pub fn dump_stack_frame(frame: &StackFrame) {
    log::error!("    RIP: {:#018x}  CS: {:#06x}", frame.rip, frame.cs);
    log::error!("    RSP: {:#018x}  SS: {:#06x}", frame.rsp, frame.ss);
    log::error!(" RFLAGS: {:#010x}", frame.rflags);
}

/// The two gate kinds the IDT uses: trap gates leave
/// interrupts enabled on entry, interrupt gates clear them.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Gate {
    Trap,
    Interrupt,
}

impl Gate {
    /// Returns the entry options for this gate kind: present,
    /// DPL 0, IST 0, and the 64-bit gate type.
    ///
    const fn options(self) -> u16 {
        const PRESENT: u16 = 1 << 15;
        match self {
            Gate::Trap => PRESENT | 0xf << 8,
            Gate::Interrupt => PRESENT | 0xe << 8,
        }
    }
}

/// A single 16-byte entry in the IDT, carrying the 64-bit
/// handler offset split across three fields.
///
#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn new(handler: usize, gate: Gate) -> Self {
        IdtEntry {
            offset_low: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            options: gate.options(),
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    /// Returns the handler offset this entry points at.
    ///
    fn handler(&self) -> usize {
        self.offset_low as usize | (self.offset_mid as usize) << 16 | (self.offset_high as usize) << 32
    }
}

/// The interrupt descriptor table. The CPU requires 16-byte
/// alignment.
///
#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; NUM_VECTORS],
}

lazy_static! {
    /// The kernel's IDT.
    ///
    /// The table memory is registered with the CPU by [`init`];
    /// later edits through [`set_isr`] and [`clear_isr`] take
    /// effect without reloading.
    ///
    static ref IDT: Mutex<Idt> = {
        let mut idt = Idt {
            entries: [IdtEntry::missing(); NUM_VECTORS],
        };

        // Default no-op handlers everywhere first, then the
        // dedicated exception handlers on top.
        for vector in 0..NUM_VECTORS {
            idt.entries[vector] = IdtEntry::new(default_isr as usize, Gate::Interrupt);
        }
        for (vector, handler) in exceptions::handlers() {
            idt.entries[vector] = IdtEntry::new(handler, Gate::Trap);
        }

        Mutex::new(idt)
    };
}

/// The default handler installed on every vector that has no
/// dedicated one. Spurious interrupts land here and are
/// dropped.
///
extern "x86-interrupt" fn default_isr(_frame: StackFrame) {}

/// Builds the IDT and registers it with the CPU.
///
pub fn init() {
    let idt = IDT.lock();
    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<Idt>() - 1) as u16,
        base: x86_64::VirtAddr::new(&idt.entries as *const _ as u64),
    };

    unsafe { lidt(&pointer) };
}

/// Describes why an ISR registration call failed.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsrError {
    /// The vector is below 32 and belongs to CPU exceptions.
    ReservedVector,
    /// The vector already holds a non-default handler.
    AlreadyRegistered,
}

/// Installs a handler for the given vector.
///
/// Fails if the vector is reserved for exceptions, or if a
/// non-default handler is already installed.
///
pub fn set_isr(vector: u8, handler: Isr) -> Result<(), IsrError> {
    // The handler takes its stack frame by value, so its
    // address is the gate target directly.
    unsafe { set_isr_raw(vector, VirtAddr::new(handler as usize)) }
}

/// Installs a handler routine at the given address for the
/// given vector.
///
/// This is the registration path for handlers with an assembly
/// prologue, such as the scheduler's context-switch routine.
///
/// # Safety
///
/// `handler` must be the address of a routine that preserves
/// all register state it touches and returns with `iretq`.
///
pub unsafe fn set_isr_raw(vector: u8, handler: VirtAddr) -> Result<(), IsrError> {
    if vector < FIRST_FREE_VECTOR {
        return Err(IsrError::ReservedVector);
    }

    let _guard = Guard::new();
    let mut idt = IDT.lock();
    if idt.entries[vector as usize].handler() != default_isr as usize {
        return Err(IsrError::AlreadyRegistered);
    }

    idt.entries[vector as usize] = IdtEntry::new(handler.as_usize(), Gate::Interrupt);
    Ok(())
}

/// Restores the default handler for the given vector.
///
pub fn clear_isr(vector: u8) -> Result<(), IsrError> {
    if vector < FIRST_FREE_VECTOR {
        return Err(IsrError::ReservedVector);
    }

    let _guard = Guard::new();
    let mut idt = IDT.lock();
    idt.entries[vector as usize] = IdtEntry::new(default_isr as usize, Gate::Interrupt);
    Ok(())
}

/// Reports whether the given vector is claimed.
///
/// Vectors below 32 belong to the exception range and always
/// report claimed, whether or not they hold a dedicated
/// handler; for the rest, this reports whether a non-default
/// handler is installed.
///
pub fn contains_isr(vector: u8) -> bool {
    if vector < FIRST_FREE_VECTOR {
        return true;
    }

    let idt = IDT.lock();
    idt.entries[vector as usize].handler() != default_isr as usize
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn test_entry_offset_split() {
        let entry = IdtEntry::new(0x1234_5678_9abc_def0, Gate::Interrupt);
        assert_eq!(entry.offset_low, 0xdef0);
        assert_eq!(entry.offset_mid, 0x9abc);
        assert_eq!(entry.offset_high, 0x1234_5678);
        assert_eq!(entry.handler(), 0x1234_5678_9abc_def0);
        assert_eq!(entry.selector, KERNEL_CODE_SELECTOR);
    }

    #[test]
    fn test_gate_options() {
        // Present, DPL 0, IST 0, 64-bit gate type in bits 8-11.
        assert_eq!(Gate::Trap.options(), 0x8f00);
        assert_eq!(Gate::Interrupt.options(), 0x8e00);
    }

    #[test]
    fn test_entry_layout() {
        // The CPU reads entries as 16-byte descriptors; the
        // table must span exactly 4 KiB.
        assert_eq!(core::mem::size_of::<IdtEntry>(), 16);
        assert_eq!(core::mem::size_of::<Idt>(), 4096);
        assert_eq!(core::mem::align_of::<Idt>(), 16);
    }
}
