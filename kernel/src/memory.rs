// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Brings up the kernel's memory management.
//!
//! The order matters: the heap must exist before the frame allocator
//! (whose region table lives in heap memory), and the page tables
//! must be walkable before the frame allocator can reserve the
//! memory already occupied by the kernel image and loader modules.

use bootinfo::BootInfo;
use heap::{BumpAllocator, Locked, KERNEL_HEAP_SIZE};
use log::{debug, info};
use memlayout::{PhysAddr, VirtAddr};

/// The kernel's heap buffer, placed in its own linker section.
///
#[link_section = ".heap"]
static mut HEAP_BUFFER: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// The kernel's global allocator: bump allocation over
/// [`HEAP_BUFFER`], no deallocation.
///
#[global_allocator]
static ALLOCATOR: Locked<BumpAllocator> = Locked::new(BumpAllocator::new());

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout)
}

extern "C" {
    /// The first address after the kernel image, provided by
    /// the linker script.
    ///
    static __kernel_end: u8;
}

/// Initialises the heap, the page tables, and the physical
/// frame allocator.
///
/// # Panics
///
/// `init` panics if the boot information has no memory map, or
/// if the kernel image's end address is not mapped.
///
pub(crate) fn init(boot_info: &BootInfo<'static>) {
    let memory_map = boot_info
        .memory_map()
        .expect("no memory map in boot information");

    info!("Physical memory map:");
    for entry in memory_map.entries() {
        debug!(
            "- [mem {:#014x}-{:#014x}] type {}",
            entry.base,
            entry.base + entry.length,
            entry.kind
        );
    }

    // The heap is a static buffer, so it only needs its bounds.
    unsafe {
        let start = core::ptr::addr_of!(HEAP_BUFFER) as usize;
        ALLOCATOR.lock().init(start, KERNEL_HEAP_SIZE);
    }

    // With the recursive mapping installed the page tables are
    // walkable, which both the occupied-frame reservation below
    // and all later mapping requests rely on.
    unsafe { virtmem::init() };

    // Everything below the end of the kernel image and of any
    // loader modules is already spoken for.
    let kernel_end = virtmem::translate(kernel_end_addr())
        .expect("kernel image end is not mapped");
    let module_end = boot_info
        .modules()
        .map(|module| module.end)
        .max()
        .unwrap_or(PhysAddr::zero());
    let occupied_end = kernel_end.max(module_end).page_up();

    unsafe { physmem::init(memory_map, occupied_end) };
}

/// Returns the virtual address of the end of the kernel image.
///
fn kernel_end_addr() -> VirtAddr {
    unsafe { VirtAddr::from_ptr(core::ptr::addr_of!(__kernel_end)) }
}
