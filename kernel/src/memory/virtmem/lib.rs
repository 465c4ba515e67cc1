// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages the mapping from virtual to physical addresses via
//! four-level page tables.
//!
//! The kernel reaches its page tables through a recursive
//! self-mapping: entry 511 of the level-4 table references the level-4
//! table itself, so the entry for any `(level, address)` pair sits at a
//! virtual address computed purely from the recursive layout (see the
//! [`recursive`] module). No page table ever needs to stay
//! identity-mapped for the kernel to edit it.
//!
//! [`translate`] walks the tables for the current address space.
//! [`map`] installs a 4 KiB mapping, allocating intermediate tables
//! from the frame allocator as needed; the returned [`MappingChange`]
//! leaves TLB invalidation to the caller, who knows whether the page
//! could have been mapped before. [`unmap`] removes a 4 KiB or 2 MiB
//! mapping and can flush the page itself.
//!
//! Callers must hold the interrupt guard across [`map`] and [`unmap`]:
//! both take the frame allocator lock, and the timer-driven scheduler
//! allocates stacks from the same allocator.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

mod entry;
mod mapping;
pub mod recursive;

pub use crate::entry::{PageFlags, PageTableEntry};
pub use crate::mapping::{
    flush_page, EntryWindow, FrameSource, MapError, MappingChange, PageTables, RecursiveWindow,
};

use crate::recursive::RECURSIVE_INDEX;
use memlayout::{phys_to_kernel, PhysAddr, VirtAddr};
use x86_64::registers::control::Cr3;

/// Installs the recursive entry in the active level-4 table
/// and flushes the TLB.
///
/// The boot shim leaves the level-4 table reachable through
/// the fixed higher-half window, which is how the slot is
/// written before the recursive window exists.
///
/// # Panics
///
/// `init` panics if level-4 slot 511 already references
/// another table.
///
/// # Safety
///
/// Must be called exactly once during bring-up, before the
/// first use of [`translate`], [`map`], or [`unmap`].
///
pub unsafe fn init() {
    let (frame, _) = Cr3::read();
    let l4_frame = PhysAddr::new(frame.start_address().as_u64() as usize);

    let table = phys_to_kernel(l4_frame).as_mut_ptr::<PageTableEntry>();
    let slot = &mut *table.add(RECURSIVE_INDEX);
    if slot.is_present() {
        assert!(
            slot.frame_addr() == l4_frame,
            "level-4 slot 511 is already in use"
        );
    } else {
        *slot = PageTableEntry::frame_with_flags(
            l4_frame,
            PageFlags::PRESENT | PageFlags::WRITABLE,
        );
    }

    // Reloading CR3 drops every cached translation, so the
    // recursive window is visible from here on.
    x86_64::instructions::tlb::flush_all();
}

/// Translates a virtual address in the current address space,
/// or returns `None` if it is not mapped.
///
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    unsafe { PageTables::new(RecursiveWindow).translate(virt) }
}

/// Maps the page at `virt` to the frame at `phys` in the
/// current address space.
///
/// Intermediate tables are allocated from the physical memory
/// manager. The caller flushes the returned change if `virt`
/// may have been mapped before.
///
/// # Safety
///
/// The caller must hold the interrupt guard and must ensure
/// that aliasing `phys` cannot break memory safety.
///
pub unsafe fn map(
    phys: PhysAddr,
    virt: VirtAddr,
    flags: PageFlags,
) -> Result<MappingChange, MapError> {
    let mut allocator = physmem::ALLOCATOR.lock();
    PageTables::new(RecursiveWindow).map(phys, virt, flags, &mut *allocator)
}

/// Removes the mapping of the page at `virt` from the current
/// address space, invalidating its cached translation if
/// `auto_flush` is set.
///
/// # Safety
///
/// The caller must hold the interrupt guard and must ensure
/// the address range is no longer in use.
///
pub unsafe fn unmap(virt: VirtAddr, auto_flush: bool) {
    PageTables::new(RecursiveWindow).unmap(virt, auto_flush)
}
