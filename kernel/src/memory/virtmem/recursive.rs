// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Derives the virtual address of any page-table entry from the
//! recursive self-mapping.
//!
//! Entry [`RECURSIVE_INDEX`] of the level-4 table references the
//! level-4 table itself. Walking that entry one or more times places
//! the CPU "inside" the page-table hierarchy, so the entry for any
//! `(level, address)` pair sits at a virtual address built by
//! reproducing the recursive index at the levels above `level` and
//! substituting the address's own indices below. The whole derivation
//! is address arithmetic; no page table is ever dereferenced here.

use memlayout::VirtAddr;

/// The level-4 slot that references the level-4 table itself.
///
pub const RECURSIVE_INDEX: usize = 511;

/// The number of entries in a page table.
///
pub const TABLE_ENTRIES: usize = 512;

/// One of the four levels of the paging hierarchy. Level four
/// is the root.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Four,
    Three,
    Two,
    One,
}

impl Level {
    /// Returns the position of this level's nine index bits
    /// within a virtual address.
    ///
    pub const fn shift(self) -> usize {
        match self {
            Level::Four => 39,
            Level::Three => 30,
            Level::Two => 21,
            Level::One => 12,
        }
    }

    /// Returns the level's index within a virtual address.
    ///
    pub const fn index_of(self, virt: VirtAddr) -> usize {
        (virt.as_usize() >> self.shift()) & (TABLE_ENTRIES - 1)
    }
}

/// Sign-extends a value built from the bits below 48.
///
const fn sign_extend(addr: usize) -> usize {
    if addr & (1 << 47) != 0 {
        addr | 0xffff_0000_0000_0000
    } else {
        addr
    }
}

/// Returns the virtual address of the level-`level` page-table
/// entry that translates `virt`.
///
/// The address places [`RECURSIVE_INDEX`] at every level above
/// `level`, shifting the address's own indices down; the entry
/// offset within the final table comes from `virt`'s index at
/// `level`.
///
pub const fn entry_addr(level: Level, virt: VirtAddr) -> VirtAddr {
    let r = RECURSIVE_INDEX;
    let base = match level {
        Level::Four => sign_extend(r << 39 | r << 30 | r << 21 | r << 12),
        Level::Three => sign_extend(r << 39 | r << 30 | r << 21),
        Level::Two => sign_extend(r << 39 | r << 30),
        Level::One => sign_extend(r << 39),
    };

    // Between the fixed base and the entry offset, the address
    // reuses virt's own indices, shifted down by one level per
    // recursion. The flat form below is equivalent to composing
    // the nine-bit indices one by one.
    let span = 48 - level.shift();
    let flat = (virt.as_usize() >> level.shift()) & ((1 << span) - 1);

    VirtAddr::new(base + flat * 8)
}

/// Returns the virtual address of the page table containing
/// the level-`level` entry for `virt`.
///
pub const fn table_addr(level: Level, virt: VirtAddr) -> VirtAddr {
    entry_addr(level, virt).page_down()
}
