// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use bitflags::bitflags;
use memlayout::PhysAddr;

// Bits [12..52) of an entry hold the frame address. Bit 51
// and above are reserved, bits 11 and below are always zero
// due to frame alignment.
//
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Represents a single entry in a page table.
///
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    /// Returns a new, empty page table entry.
    ///
    #[inline]
    pub const fn new() -> Self {
        PageTableEntry { entry: 0 }
    }

    /// Returns an entry referencing the given frame with the
    /// given flags.
    ///
    #[inline]
    pub fn frame_with_flags(frame: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(frame.as_usize() as u64 & !ADDR_MASK == 0);
        PageTableEntry {
            entry: frame.as_usize() as u64 | flags.bits(),
        }
    }

    /// Clears this entry.
    ///
    /// A non-present entry carries no other information, so
    /// every field is zeroed, not just the present bit.
    ///
    #[inline]
    pub fn zero(&mut self) {
        self.entry = 0;
    }

    /// Returns whether the entry is marked as present.
    ///
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.bits() != 0
    }

    /// Returns whether the entry maps a huge page rather than
    /// referencing a child page table.
    ///
    #[inline]
    pub const fn is_huge(&self) -> bool {
        self.entry & PageFlags::HUGE.bits() != 0
    }

    /// Returns the flags for this entry.
    ///
    #[inline]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.entry)
    }

    /// Returns the physical frame address in this entry. The
    /// least significant 12 bits are always unset.
    ///
    #[inline]
    pub const fn frame_addr(&self) -> PhysAddr {
        PhysAddr::new((self.entry & ADDR_MASK) as usize)
    }
}

bitflags! {
    /// The flags in a page table entry.
    ///
    pub struct PageFlags: u64 {
        /// The referenced page table or frame is mapped and
        /// usable. Implied by a successful `map`; callers
        /// never pass it.
        const PRESENT = 1 << 0;

        /// The referenced memory is writable. If unset on an
        /// intermediate entry, nothing below it is writable,
        /// irrespective of the lower tables' flags.
        const WRITABLE = 1 << 1;

        /// Accesses from ring 3 are allowed.
        const USER = 1 << 2;

        /// Caching for this memory is write-through rather
        /// than write-back.
        const WRITE_THROUGH = 1 << 3;

        /// The memory is not cached.
        const NO_CACHE = 1 << 4;

        /// The referenced memory has been read since this bit
        /// was last cleared.
        const ACCESSED = 1 << 5;

        /// The referenced memory has been written since this
        /// bit was last cleared.
        const DIRTY = 1 << 6;

        /// The entry maps a huge frame directly, rather than
        /// referencing a child page table.
        const HUGE = 1 << 7;

        /// The mapping survives address-space switches.
        const GLOBAL = 1 << 8;

        /// The referenced memory cannot be used for
        /// instruction fetches.
        const NO_EXECUTE = 1 << 63;
    }
}
