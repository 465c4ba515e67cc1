// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's bring-up sequence and panic machinery.
//!
//! [`init`] takes the loader's hand-off and initialises every
//! subsystem in dependency order, leaves first:
//!
//! 1. serial logging, so everything after it can report progress;
//! 2. the boot information block (validating the loader's magic);
//! 3. the IDT, so early faults are diagnosable;
//! 4. the kernel symbol table, so panics can be symbolised;
//! 5. the PIC, remapped and fully masked;
//! 6. memory: the heap buffer, the recursive page-table mapping, and
//!    the physical frame allocator;
//! 7. the clock (TSC calibration and the periodic timer);
//! 8. CPU feature checks and SSE enablement;
//! 9. the scheduler, adopting the boot context as the first thread.
//!
//! Interrupts stay disabled throughout; `thread::start` enables them
//! once the caller is ready to become the idle loop.
//!
//! There is no global constructor pass: process-wide state lives in
//! lazily initialised statics, and the order above is the only
//! initialisation order in the kernel.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

#[cfg(target_os = "none")]
mod logger;
#[cfg(target_os = "none")]
mod memory;
pub mod trace;

#[cfg(target_os = "none")]
use bootinfo::BootInfo;
#[cfg(target_os = "none")]
use log::info;
#[cfg(target_os = "none")]
use memlayout::PhysAddr;

/// Initialises the kernel's core subsystems, in order.
///
/// `magic` and `info_addr` are the two values the loader hands
/// over in registers.
///
/// # Panics
///
/// `init` panics if the magic value is not multiboot2's, if
/// the boot information has no memory map, or if the CPU lacks
/// a required feature.
///
#[cfg(target_os = "none")]
pub fn init(magic: u32, info_addr: PhysAddr) -> BootInfo<'static> {
    serial::init();
    logger::init();
    info!("Kernel booting...");

    let boot_info = unsafe { BootInfo::load(magic, info_addr) };
    if let Some(name) = boot_info.loader_name() {
        info!("Booted via: {}", name);
    }
    if let Some(cmdline) = boot_info.cmdline() {
        info!("Boot command line: {}", cmdline);
    }

    interrupts::init();
    symbols::init(&boot_info);
    interrupts::pic::init();
    memory::init(&boot_info);

    if let Some(rsdp) = boot_info.acpi_rsdp() {
        info!(
            "ACPI tables: OEM {:?}, revision {}, RSDT at {:#x}.",
            rsdp.oem_id, rsdp.revision, rsdp.rsdt_addr
        );
    }

    time::init();

    cpu::check_features();
    unsafe { cpu::enable_sse() };

    thread::init();

    boot_info
}

/// Halts the CPU forever, with interrupts disabled.
///
pub fn halt_loop() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
