// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::entry::{PageFlags, PageTableEntry};
use crate::recursive::{entry_addr, Level};
use log::warn;
use memlayout::{PhysAddr, VirtAddr, PAGE_SIZE};

/// A source of fresh physical frames for intermediate page
/// tables.
///
/// # Safety
///
/// Implementations must only return unused, page-aligned
/// frames.
///
pub unsafe trait FrameSource {
    /// Allocates one 4 KiB frame, or returns `None` if
    /// physical memory is exhausted.
    ///
    fn allocate_frame(&mut self) -> Option<PhysAddr>;
}

unsafe impl FrameSource for physmem::FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        self.alloc()
    }
}

/// Locates page-table entries in memory.
///
/// The kernel's window is the recursive self-mapping
/// ([`RecursiveWindow`]); tests substitute a window over
/// emulated tables so the same walker logic runs in a normal
/// process.
///
/// # Safety
///
/// Implementations must return pointers into 4 KiB-aligned
/// page tables laid out as 512 consecutive entries, and the
/// pointer for `(level, virt)` must be valid whenever every
/// entry above `level` on `virt`'s walk is present.
///
pub unsafe trait EntryWindow {
    /// Returns a pointer to the level-`level` entry on the
    /// walk of `virt`.
    ///
    /// # Safety
    ///
    /// The caller must have established that every entry
    /// above `level` is present.
    ///
    unsafe fn entry(&self, level: Level, virt: VirtAddr) -> *mut PageTableEntry;
}

/// The kernel's page-table window, through the recursive
/// self-mapping.
///
pub struct RecursiveWindow;

unsafe impl EntryWindow for RecursiveWindow {
    unsafe fn entry(&self, level: Level, virt: VirtAddr) -> *mut PageTableEntry {
        entry_addr(level, virt).as_mut_ptr()
    }
}

/// Describes why a mapping request failed.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// Physical memory is exhausted: a new page table could
    /// not be allocated.
    NoFrame,
    /// The target leaf entry already maps a frame.
    AlreadyMapped,
    /// The walk met a level-2 entry that maps a huge page
    /// where a 4 KiB mapping was requested.
    MapsHuge,
}

/// A page mapping that has been changed. The change must
/// either be flushed from the TLB or explicitly ignored; until
/// then the CPU may keep using the old translation.
///
#[derive(Debug, PartialEq)]
#[must_use = "changed page mappings must be flushed from the TLB, or the change ignored explicitly"]
pub struct MappingChange {
    virt: VirtAddr,
}

impl MappingChange {
    fn new(virt: VirtAddr) -> Self {
        MappingChange { virt }
    }

    /// Invalidates the changed page's cached translation.
    ///
    #[inline]
    pub fn flush(self) {
        flush_page(self.virt);
    }

    /// Ignores the change, leaving the TLB untouched.
    ///
    /// The caller becomes responsible for a later full or
    /// batched flush.
    ///
    #[inline]
    pub fn ignore(self) {}
}

/// Invalidates the cached translation of the page containing
/// `virt`.
///
pub fn flush_page(virt: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_usize() as u64));
}

/// Walks, reads and edits a four-level page-table hierarchy
/// through an [`EntryWindow`].
///
pub struct PageTables<W: EntryWindow> {
    window: W,
}

impl<W: EntryWindow> PageTables<W> {
    /// Returns a walker over the tables reachable through
    /// `window`.
    ///
    pub const fn new(window: W) -> Self {
        PageTables { window }
    }

    /// Translates a virtual address into the physical address
    /// it maps to, or `None` if any entry on the walk is not
    /// present.
    ///
    /// # Safety
    ///
    /// The window's tables must describe valid memory.
    ///
    pub unsafe fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let l4 = &*self.window.entry(Level::Four, virt);
        if !l4.is_present() {
            return None;
        }

        let l3 = &*self.window.entry(Level::Three, virt);
        if !l3.is_present() {
            return None;
        }

        let l2 = &*self.window.entry(Level::Two, virt);
        if !l2.is_present() {
            return None;
        }

        if l2.is_huge() {
            return Some(l2.frame_addr() + (virt.as_usize() & 0x1f_ffff));
        }

        let l1 = &*self.window.entry(Level::One, virt);
        if !l1.is_present() {
            return None;
        }

        Some(l1.frame_addr() + (virt.as_usize() & 0xfff))
    }

    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// Missing intermediate tables are allocated from
    /// `allocator`, zeroed, and installed writable. On success
    /// the leaf entry holds `phys`, the requested flags, and
    /// the present bit; the returned [`MappingChange`] leaves
    /// the TLB flush to the caller, who knows whether `virt`
    /// could have been mapped before.
    ///
    /// # Safety
    ///
    /// The caller must ensure `frame` is not aliased in a way
    /// that breaks memory safety, and must hold the interrupt
    /// guard so the walk is not re-entered.
    ///
    pub unsafe fn map<A>(
        &mut self,
        phys: PhysAddr,
        virt: VirtAddr,
        flags: PageFlags,
        allocator: &mut A,
    ) -> Result<MappingChange, MapError>
    where
        A: FrameSource + ?Sized,
    {
        assert!(phys.is_page_aligned());
        assert!(virt.is_page_aligned());
        debug_assert!(
            !flags.contains(PageFlags::PRESENT),
            "PRESENT is implied and must not be passed"
        );

        self.ensure_table(Level::Four, Level::Three, virt, allocator)?;
        self.ensure_table(Level::Three, Level::Two, virt, allocator)?;

        let l2 = &mut *self.window.entry(Level::Two, virt);
        if l2.is_present() && l2.is_huge() {
            return Err(MapError::MapsHuge);
        }
        self.ensure_table(Level::Two, Level::One, virt, allocator)?;

        let l1 = &mut *self.window.entry(Level::One, virt);
        if l1.is_present() {
            return Err(MapError::AlreadyMapped);
        }

        *l1 = PageTableEntry::frame_with_flags(phys, flags | PageFlags::PRESENT);
        Ok(MappingChange::new(virt))
    }

    /// Removes the mapping of the page at `virt`.
    ///
    /// The leaf entry (level 2 for a huge page, level 1
    /// otherwise) is cleared to zero. A walk that meets a
    /// non-present entry is a logged warning, not an error.
    /// If `auto_flush` is set the page's cached translation is
    /// invalidated; otherwise the caller is responsible for a
    /// later full or batched flush.
    ///
    /// # Safety
    ///
    /// The caller must ensure the virtual address range being
    /// unmapped is no longer in use.
    ///
    pub unsafe fn unmap(&mut self, virt: VirtAddr, auto_flush: bool) {
        let l4 = &*self.window.entry(Level::Four, virt);
        if !l4.is_present() {
            warn!("unmap {:?}: level-4 entry already not mapped", virt);
            return;
        }

        let l3 = &*self.window.entry(Level::Three, virt);
        if !l3.is_present() {
            warn!("unmap {:?}: level-3 entry already not mapped", virt);
            return;
        }

        let l2 = &mut *self.window.entry(Level::Two, virt);
        if !l2.is_present() {
            warn!("unmap {:?}: level-2 entry already not mapped", virt);
            return;
        }

        if l2.is_huge() {
            l2.zero();
            if auto_flush {
                flush_page(virt);
            }
            return;
        }

        let l1 = &mut *self.window.entry(Level::One, virt);
        if !l1.is_present() {
            warn!("unmap {:?}: level-1 entry already not mapped", virt);
            return;
        }

        l1.zero();
        if auto_flush {
            flush_page(virt);
        }
    }

    /// Ensures the `parent`-level entry on `virt`'s walk
    /// references a page table, allocating and zeroing a new
    /// `child`-level table if the entry is not present.
    ///
    unsafe fn ensure_table<A>(
        &mut self,
        parent: Level,
        child: Level,
        virt: VirtAddr,
        allocator: &mut A,
    ) -> Result<(), MapError>
    where
        A: FrameSource + ?Sized,
    {
        let entry = &mut *self.window.entry(parent, virt);
        if entry.is_present() {
            return Ok(());
        }

        let frame = allocator.allocate_frame().ok_or(MapError::NoFrame)?;
        *entry = PageTableEntry::frame_with_flags(frame, PageFlags::PRESENT | PageFlags::WRITABLE);

        // The new table becomes addressable through the window
        // the moment its parent entry is written. The previous
        // entry was not present, so no stale translation can
        // be cached for the window page.
        let table = self.window.entry(child, virt) as usize & !(PAGE_SIZE - 1);
        core::ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::recursive::TABLE_ENTRIES;
    use std::boxed::Box;
    use std::vec::Vec;
    use x86_64::structures::paging;
    use x86_64::structures::paging::{Mapper, Translate};

    // A page-sized, page-aligned buffer. Because it has the
    // same layout as a page table, its host address can stand
    // in for a frame address when the physical-memory offset
    // is taken to be zero, the same trick the x86_64 crate's
    // OffsetPageTable tests rely on.
    #[repr(C, align(4096))]
    struct FakeTable {
        bytes: [u8; PAGE_SIZE],
    }

    // Hands out fake frames backed by boxed tables, with an
    // optional allocation budget for exhaustion tests.
    struct FakeFrames {
        buffers: Vec<Box<FakeTable>>,
        budget: Option<usize>,
    }

    impl FakeFrames {
        fn new() -> Self {
            FakeFrames {
                buffers: Vec::new(),
                budget: None,
            }
        }

        fn with_budget(budget: usize) -> Self {
            FakeFrames {
                buffers: Vec::new(),
                budget: Some(budget),
            }
        }

        fn allocated(&self) -> usize {
            self.buffers.len()
        }
    }

    unsafe impl FrameSource for FakeFrames {
        fn allocate_frame(&mut self) -> Option<PhysAddr> {
            if let Some(budget) = self.budget {
                if self.buffers.len() >= budget {
                    return None;
                }
            }

            let table = Box::new(FakeTable {
                bytes: [0u8; PAGE_SIZE],
            });
            let addr = PhysAddr::new(table.as_ref() as *const FakeTable as usize);
            self.buffers.push(table);
            Some(addr)
        }
    }

    unsafe impl paging::FrameAllocator<paging::Size4KiB> for FakeFrames {
        fn allocate_frame(&mut self) -> Option<paging::PhysFrame> {
            let addr = FrameSource::allocate_frame(self)?;
            let addr = x86_64::PhysAddr::new(addr.as_usize() as u64);
            Some(paging::PhysFrame::from_start_address(addr).expect("unaligned fake table"))
        }
    }

    // A window over emulated tables rooted at a boxed level-4
    // table, with frame addresses interpreted as host pointers
    // (physical-memory offset zero). The walker only asks for
    // an entry once everything above it is present, so the
    // walk below can follow frame addresses blindly.
    struct EmulatedWindow {
        root: *mut PageTableEntry,
    }

    unsafe impl EntryWindow for EmulatedWindow {
        unsafe fn entry(&self, level: Level, virt: VirtAddr) -> *mut PageTableEntry {
            let path: &[Level] = match level {
                Level::Four => &[],
                Level::Three => &[Level::Four],
                Level::Two => &[Level::Four, Level::Three],
                Level::One => &[Level::Four, Level::Three, Level::Two],
            };

            let mut table = self.root;
            for lvl in path {
                let entry = &*table.add(lvl.index_of(virt));
                assert!(entry.is_present(), "walked through a non-present entry");
                table = entry.frame_addr().as_usize() as *mut PageTableEntry;
            }

            table.add(level.index_of(virt))
        }
    }

    // Builds an empty level-4 table (as an x86_64 table so it
    // can be cross-checked) and a walker over it.
    fn fresh_tables() -> (Box<paging::PageTable>, PageTables<EmulatedWindow>) {
        let mut root = Box::new(paging::PageTable::new());
        let window = EmulatedWindow {
            root: root.as_mut() as *mut paging::PageTable as *mut PageTableEntry,
        };
        (root, PageTables::new(window))
    }

    #[test]
    fn test_map_translate_roundtrip() {
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        let phys = PhysAddr::new(0xa000);
        let virt = VirtAddr::new(0xffff_ffff_8010_0000);

        assert_eq!(unsafe { tables.translate(virt) }, None);

        unsafe { tables.map(phys, virt, PageFlags::WRITABLE, &mut frames) }
            .expect("map failed")
            .ignore();

        assert_eq!(unsafe { tables.translate(virt) }, Some(phys));
        assert_eq!(
            unsafe { tables.translate(virt + 0xfff) },
            Some(PhysAddr::new(0xafff))
        );
        for k in [1usize, 0x123, 0x800] {
            assert_eq!(unsafe { tables.translate(virt + k) }, Some(phys + k));
        }

        // The next page up and the last address below are
        // unmapped.
        assert_eq!(unsafe { tables.translate(virt + 0x1000) }, None);
        assert_eq!(unsafe { tables.translate(virt - 1) }, None);
    }

    #[test]
    fn test_remap_conflict() {
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        let virt = VirtAddr::new(0xffff_ffff_8010_0000);
        unsafe { tables.map(PhysAddr::new(0xa000), virt, PageFlags::WRITABLE, &mut frames) }
            .expect("first map failed")
            .ignore();

        assert_eq!(
            unsafe { tables.map(PhysAddr::new(0xb000), virt, PageFlags::WRITABLE, &mut frames) },
            Err(MapError::AlreadyMapped)
        );

        // The original mapping is untouched.
        assert_eq!(
            unsafe { tables.translate(virt) },
            Some(PhysAddr::new(0xa000))
        );
    }

    #[test]
    fn test_leaf_flags() {
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        let virt = VirtAddr::new(0x7123_4567_8000);
        let flags = PageFlags::WRITABLE | PageFlags::GLOBAL | PageFlags::NO_EXECUTE;
        unsafe { tables.map(PhysAddr::new(0x6000), virt, flags, &mut frames) }
            .expect("map failed")
            .ignore();

        let leaf = unsafe { &*tables.window.entry(Level::One, virt) };
        assert_eq!(leaf.flags(), flags | PageFlags::PRESENT);
        assert_eq!(leaf.frame_addr(), PhysAddr::new(0x6000));
    }

    #[test]
    fn test_intermediate_tables_shared() {
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        let virt = VirtAddr::new(0xffff_8000_4000_0000);
        unsafe { tables.map(PhysAddr::new(0x1000), virt, PageFlags::WRITABLE, &mut frames) }
            .expect("map failed")
            .ignore();
        assert_eq!(frames.allocated(), 3);

        // The neighbouring page reuses all three intermediate
        // tables.
        unsafe {
            tables.map(
                PhysAddr::new(0x2000),
                virt + PAGE_SIZE,
                PageFlags::WRITABLE,
                &mut frames,
            )
        }
        .expect("map failed")
        .ignore();
        assert_eq!(frames.allocated(), 3);
    }

    #[test]
    fn test_allocation_failure() {
        let virt = VirtAddr::new(0xffff_8000_4000_0000);

        // No budget at all: the level-3 table cannot be made.
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::with_budget(0);
        assert_eq!(
            unsafe { tables.map(PhysAddr::new(0x1000), virt, PageFlags::WRITABLE, &mut frames) },
            Err(MapError::NoFrame)
        );

        // A budget of two fails on the level-1 table.
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::with_budget(2);
        assert_eq!(
            unsafe { tables.map(PhysAddr::new(0x1000), virt, PageFlags::WRITABLE, &mut frames) },
            Err(MapError::NoFrame)
        );
    }

    #[test]
    fn test_unmap_idempotent() {
        let (_root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        let virt = VirtAddr::new(0xffff_ffff_8010_0000);
        let phys = PhysAddr::new(0xa000);

        assert_eq!(unsafe { tables.translate(virt) }, None);
        unsafe { tables.map(phys, virt, PageFlags::WRITABLE, &mut frames) }
            .expect("map failed")
            .ignore();
        assert_eq!(unsafe { tables.translate(virt) }, Some(phys));

        unsafe { tables.unmap(virt, false) };
        assert_eq!(unsafe { tables.translate(virt) }, None);

        // The leaf entry is fully cleared, not just marked
        // non-present.
        let leaf = unsafe { &*tables.window.entry(Level::One, virt) };
        assert!(leaf.flags().is_empty());
        assert_eq!(leaf.frame_addr(), PhysAddr::zero());

        // Unmapping again is a warning, not a crash, and the
        // page can be mapped afresh.
        unsafe { tables.unmap(virt, false) };
        unsafe { tables.map(phys, virt, PageFlags::WRITABLE, &mut frames) }
            .expect("remap after unmap failed")
            .ignore();
        assert_eq!(unsafe { tables.translate(virt) }, Some(phys));
    }

    #[test]
    fn test_huge_mappings() {
        let (mut root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        // Build a 2 MiB mapping with the x86_64 crate, then
        // check this walker agrees about what it means.
        let virt = VirtAddr::new(0x7234_5680_0000);
        let phys = PhysAddr::new(0x1234_5660_0000);
        {
            let mut offset_tables = unsafe {
                paging::OffsetPageTable::new(root.as_mut(), x86_64::VirtAddr::new(0))
            };
            unsafe {
                offset_tables
                    .map_to(
                        paging::Page::<paging::Size2MiB>::from_start_address(
                            x86_64::VirtAddr::new(virt.as_usize() as u64),
                        )
                        .unwrap(),
                        paging::PhysFrame::<paging::Size2MiB>::from_start_address(
                            x86_64::PhysAddr::new(phys.as_usize() as u64),
                        )
                        .unwrap(),
                        paging::PageTableFlags::PRESENT | paging::PageTableFlags::WRITABLE,
                        &mut frames,
                    )
                    .unwrap()
                    .ignore();
            }
        }

        // Translation folds the 21-bit offset into the huge
        // frame.
        assert_eq!(unsafe { tables.translate(virt) }, Some(phys));
        assert_eq!(
            unsafe { tables.translate(virt + 0x1f_ffff) },
            Some(phys + 0x1f_ffff)
        );

        // A 4 KiB mapping inside the huge page is refused.
        assert_eq!(
            unsafe {
                tables.map(
                    PhysAddr::new(0x3000),
                    virt + 0x1000,
                    PageFlags::WRITABLE,
                    &mut frames,
                )
            },
            Err(MapError::MapsHuge)
        );

        // Unmapping clears the level-2 entry.
        unsafe { tables.unmap(virt, false) };
        assert_eq!(unsafe { tables.translate(virt) }, None);
    }

    #[test]
    fn test_cross_check_with_x86_64() {
        let (mut root, mut tables) = fresh_tables();
        let mut frames = FakeFrames::new();

        let cases = [
            (0x1000usize, 0x6000usize, PageFlags::WRITABLE),
            (
                0x7123_4567_8000,
                0x0007_edcb_a987_6000,
                PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            ),
            (
                0xffff_8765_4321_0000,
                0x7_6540_0000,
                PageFlags::WRITABLE | PageFlags::USER | PageFlags::NO_CACHE,
            ),
        ];

        for &(virt, phys, flags) in cases.iter() {
            unsafe {
                tables.map(PhysAddr::new(phys), VirtAddr::new(virt), flags, &mut frames)
            }
            .expect("map failed")
            .ignore();
        }

        // The x86_64 crate must agree with every translation,
        // including the boundaries of each mapping.
        let offset_tables =
            unsafe { paging::OffsetPageTable::new(root.as_mut(), x86_64::VirtAddr::new(0)) };
        for &(virt, phys, _flags) in cases.iter() {
            for k in [0usize, 1, 0xfff] {
                assert_eq!(
                    offset_tables.translate_addr(x86_64::VirtAddr::new((virt + k) as u64)),
                    Some(x86_64::PhysAddr::new((phys + k) as u64)),
                    "x86_64 disagrees at {:#x}+{:#x}",
                    virt,
                    k
                );
            }
            assert_eq!(
                offset_tables.translate_addr(x86_64::VirtAddr::new((virt + PAGE_SIZE) as u64)),
                None
            );
        }
    }

    #[test]
    fn test_table_entries_constant() {
        // The walker assumes 512-entry, 4 KiB tables; the
        // x86_64 crate's table type must agree.
        assert_eq!(
            core::mem::size_of::<paging::PageTable>(),
            TABLE_ENTRIES * core::mem::size_of::<PageTableEntry>()
        );
        assert_eq!(core::mem::size_of::<paging::PageTable>(), PAGE_SIZE);
    }
}
