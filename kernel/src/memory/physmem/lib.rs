// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management and allocation.
//!
//! The allocator tracks every usable region of physical memory from the
//! firmware's memory map. Each region carries a bitmap of zone words
//! ([`ZONE_BITS`] frames per word); bit `i` of zone `z` is set iff the
//! frame at `lower + (z * ZONE_BITS + i) * PAGE_SIZE` is allocated. The
//! bitmap grows lazily: frames beyond the last zone word are implicitly
//! free, and a fresh zone word is only appended once every existing
//! zone in the region is full.
//!
//! Allocation is first-fit: the first region with free frames, the
//! lowest non-full zone, the lowest clear bit. There is no coalescing
//! and no colouring.
//!
//! The set of regions is fixed after [`init`], which also reserves
//! every frame already consumed by the kernel image and the loader
//! modules. Callers must hold the interrupt guard across
//! [`allocate_frame`] and [`deallocate_frame`]; the timer-driven
//! scheduler allocates thread stacks and would otherwise re-enter the
//! allocator mid-mutation.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

extern crate alloc;

use alloc::vec::Vec;
use bootinfo::MemoryMap;
use lazy_static::lazy_static;
use log::{info, warn};
use memlayout::{PhysAddr, PAGE_SIZE};
use pretty::Bytes;
use spin::Mutex;

/// The number of frames tracked by one zone word of a
/// region's bitmap.
///
pub const ZONE_BITS: usize = u64::BITS as usize;

lazy_static! {
    /// The physical memory allocator.
    ///
    /// `ALLOCATOR` starts out empty and is given the firmware's
    /// memory map by [`init`]. The [`allocate_frame`] and
    /// [`deallocate_frame`] helpers are the usual way in.
    ///
    pub static ref ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());
}

/// Sets up the physical memory manager from the firmware's
/// memory map.
///
/// Every frame below `occupied_end` is marked allocated; the
/// caller computes that bound from the end of the kernel image
/// and of any loader modules, rounded up to a page boundary.
///
/// # Safety
///
/// The caller must guarantee that the memory map is valid and
/// complete, and that all usable memory at and above
/// `occupied_end` is unused. `init` must be called at most once.
///
pub unsafe fn init(memory_map: MemoryMap, occupied_end: PhysAddr) {
    let mut alloc = FrameAllocator::new(memory_map);
    alloc.reserve_up_to(occupied_end);

    let total = alloc.total_memory();
    info!("Physical memory: {} usable.", Bytes::from_usize(total));

    *ALLOCATOR.lock() = alloc;
}

/// Returns the next free physical frame, or `None` if every
/// region is fully allocated.
///
/// If `allocate_frame` is called before [`init`], it returns
/// `None`.
///
pub fn allocate_frame() -> Option<PhysAddr> {
    ALLOCATOR.lock().alloc()
}

/// Returns the given frame to the free pool.
///
/// # Safety
///
/// The caller must ensure the frame is unused.
///
pub unsafe fn deallocate_frame(addr: PhysAddr) {
    ALLOCATOR.lock().free(addr);
}

/// Prints debug information about the physical memory manager.
///
pub fn debug() {
    ALLOCATOR.lock().debug();
}

/// A single contiguous region of usable physical memory,
/// tracked by a lazily grown zone bitmap.
///
struct Region {
    // The address of the first frame in the region.
    // Guaranteed to be page-aligned.
    lower: PhysAddr,

    // The address one past the last frame in the region.
    // Guaranteed to be page-aligned.
    upper: PhysAddr,

    // One bit per frame, grouped into zone words. May be
    // shorter than `zones()`; missing words are all-free.
    bitmap: Vec<u64>,

    // The number of allocated frames in this region. Always
    // equal to the number of set bits in `bitmap`.
    allocated: usize,
}

impl Region {
    fn new(lower: PhysAddr, upper: PhysAddr) -> Self {
        Region {
            lower,
            upper,
            bitmap: Vec::new(),
            allocated: 0,
        }
    }

    /// Returns the region's size in bytes.
    ///
    fn size(&self) -> usize {
        self.upper - self.lower
    }

    /// Returns the number of frames in the region.
    ///
    fn pages(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    /// Returns whether the region's half-open interval
    /// contains the given address.
    ///
    fn contains(&self, addr: PhysAddr) -> bool {
        self.lower <= addr && addr < self.upper
    }

    /// Returns the address of frame `index`.
    ///
    fn frame_at(&self, index: usize) -> PhysAddr {
        self.lower + index * PAGE_SIZE
    }

    /// Marks the first `frames` frames as allocated, whole
    /// zone words first, then a partial word for the rest.
    ///
    fn reserve(&mut self, frames: usize) {
        debug_assert!(self.bitmap.is_empty() && self.allocated == 0);

        let zones = frames / ZONE_BITS;
        let bits = frames % ZONE_BITS;

        self.bitmap.clear();
        self.bitmap.resize(zones, !0u64);
        if bits != 0 {
            self.bitmap.push((1u64 << bits) - 1);
        }

        self.allocated = frames;
    }

    /// Returns the next free frame in this region, or `None`.
    ///
    fn alloc(&mut self) -> Option<PhysAddr> {
        if self.allocated == self.pages() {
            return None;
        }

        for (zone, word) in self.bitmap.iter_mut().enumerate() {
            if *word == !0u64 {
                continue;
            }

            let bit = word.trailing_ones() as usize;
            *word |= 1u64 << bit;
            self.allocated += 1;

            let addr = self.frame_at(zone * ZONE_BITS + bit);
            debug_assert!(self.contains(addr));
            return Some(addr);
        }

        // Every zone word so far is full, but the region still
        // has untracked frames: grow the bitmap by one word.
        self.bitmap.push(1u64);
        self.allocated += 1;

        let addr = self.frame_at((self.bitmap.len() - 1) * ZONE_BITS);
        debug_assert!(self.contains(addr));
        Some(addr)
    }

    /// Clears the bit for the given frame. Returns `false` if
    /// the frame was not allocated.
    ///
    fn free(&mut self, addr: PhysAddr) -> bool {
        let index = (addr - self.lower) / PAGE_SIZE;
        let zone = index / ZONE_BITS;
        let bit = index % ZONE_BITS;

        if zone >= self.bitmap.len() || self.bitmap[zone] & (1u64 << bit) == 0 {
            return false;
        }

        self.bitmap[zone] &= !(1u64 << bit);
        self.allocated -= 1;
        true
    }
}

/// The physical frame allocator, tracking every usable region
/// of memory.
///
pub struct FrameAllocator {
    regions: Vec<Region>,
}

impl FrameAllocator {
    /// Returns an empty allocator, which can allocate no
    /// memory.
    ///
    pub fn empty() -> Self {
        FrameAllocator {
            regions: Vec::new(),
        }
    }

    /// Creates a `FrameAllocator` from the firmware's memory
    /// map.
    ///
    /// Each available entry is rounded inwards to page
    /// boundaries; entries that collapse to nothing are
    /// dropped.
    ///
    pub fn new(memory_map: MemoryMap) -> Self {
        let regions = memory_map
            .entries()
            .filter(|entry| entry.is_available())
            .filter_map(|entry| {
                let lower = PhysAddr::new(entry.base as usize).page_up();
                let upper = PhysAddr::new((entry.base + entry.length) as usize).page_down();
                if lower < upper {
                    Some(Region::new(lower, upper))
                } else {
                    None
                }
            })
            .collect();

        FrameAllocator { regions }
    }

    /// Marks every frame below `occupied_end` as allocated.
    ///
    /// Regions wholly below the bound become fully allocated;
    /// the region containing the bound is allocated up to it;
    /// higher regions are left free.
    ///
    pub fn reserve_up_to(&mut self, occupied_end: PhysAddr) {
        for region in self.regions.iter_mut() {
            if occupied_end >= region.upper {
                let pages = region.pages();
                region.reserve(pages);
            } else if region.contains(occupied_end) {
                let pages = (occupied_end - region.lower) / PAGE_SIZE;
                region.reserve(pages);
            }
        }
    }

    /// Returns the next free frame, or `None` if every region
    /// is fully allocated.
    ///
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        self.regions.iter_mut().find_map(Region::alloc)
    }

    /// Returns the given frame to the free pool.
    ///
    /// Freeing an address outside every region is a logged
    /// no-op; freeing a frame that is already free is a logged
    /// warning. Neither is fatal.
    ///
    pub fn free(&mut self, addr: PhysAddr) {
        for region in self.regions.iter_mut() {
            if !region.contains(addr) {
                continue;
            }

            if !region.free(addr) {
                warn!("freed frame {:?} was not allocated", addr);
            }

            return;
        }

        warn!("freed frame {:?} is in no usable region", addr);
    }

    /// Returns the total number of usable bytes across all
    /// regions.
    ///
    pub fn total_memory(&self) -> usize {
        self.regions.iter().map(Region::size).sum()
    }

    /// Returns the total number of allocated frames across
    /// all regions.
    ///
    pub fn allocated_frames(&self) -> usize {
        self.regions.iter().map(|region| region.allocated).sum()
    }

    /// Prints debug information about the allocator's state.
    ///
    pub fn debug(&self) {
        for region in self.regions.iter() {
            info!(
                "{:#011x}-{:#011x} {:5} frames, {:5} allocated, {} free",
                region.lower.as_usize(),
                region.upper.as_usize(),
                region.pages(),
                region.allocated,
                Bytes::from_usize((region.pages() - region.allocated) * PAGE_SIZE),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use bootinfo::MemoryMapEntry;
    use std::vec::Vec;

    // Builds an allocator over literal regions, skipping the
    // boot-info plumbing.
    fn allocator_for(regions: &[(usize, usize)]) -> FrameAllocator {
        FrameAllocator {
            regions: regions
                .iter()
                .map(|&(lower, upper)| Region::new(PhysAddr::new(lower), PhysAddr::new(upper)))
                .collect(),
        }
    }

    #[test]
    fn test_region_rounding() {
        // Unaligned available entries are rounded inwards, and
        // entries that collapse are dropped.
        let entries = [
            MemoryMapEntry {
                base: 0x1234,
                length: 0x3000,
                kind: 1,
            },
            MemoryMapEntry {
                base: 0x10_0000,
                length: 0x800,
                kind: 1,
            },
            MemoryMapEntry {
                base: 0x20_0000,
                length: 0x10_0000,
                kind: 2,
            },
        ];

        let regions: Vec<Region> = entries
            .iter()
            .filter(|entry| entry.is_available())
            .filter_map(|entry| {
                let lower = PhysAddr::new(entry.base as usize).page_up();
                let upper = PhysAddr::new((entry.base + entry.length) as usize).page_down();
                (lower < upper).then(|| Region::new(lower, upper))
            })
            .collect();

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].lower, PhysAddr::new(0x2000));
        assert_eq!(regions[0].upper, PhysAddr::new(0x4000));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        // A single region of four frames hands them out in
        // order, refuses a fifth, and reuses a freed frame.
        let mut alloc = allocator_for(&[(0x0, 0x4000)]);

        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x0)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x1000)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x2000)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x3000)));
        assert_eq!(alloc.alloc(), None);

        alloc.free(PhysAddr::new(0x2000));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x2000)));
        assert_eq!(alloc.alloc(), None);
    }

    #[test]
    fn test_first_fit_across_regions() {
        let mut alloc = allocator_for(&[(0x4000, 0x6000), (0x10_000, 0x12_000)]);

        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x4000)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x5000)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x10_000)));

        // Freeing in the first region moves allocation back
        // down to it.
        alloc.free(PhysAddr::new(0x4000));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x4000)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x11_000)));
        assert_eq!(alloc.alloc(), None);
    }

    #[test]
    fn test_zone_growth() {
        // A region larger than one zone word appends a new
        // word once the first 64 frames are taken.
        let pages = ZONE_BITS + 4;
        let mut alloc = allocator_for(&[(0x0, pages * PAGE_SIZE)]);

        for i in 0..pages {
            assert_eq!(alloc.alloc(), Some(PhysAddr::new(i * PAGE_SIZE)));
        }
        assert_eq!(alloc.alloc(), None);
        assert_eq!(alloc.regions[0].bitmap.len(), 2);
    }

    #[test]
    fn test_reservation() {
        let mut alloc = allocator_for(&[
            (0x0, 0x4000),
            (0x10_000, 0x20_000),
            (0x100_000, 0x140_000),
        ]);

        // The bound falls inside the second region.
        alloc.reserve_up_to(PhysAddr::new(0x12_000));

        // First region: fully allocated.
        assert_eq!(alloc.regions[0].allocated, 4);
        // Second region: allocated up to the bound.
        assert_eq!(alloc.regions[1].allocated, 2);
        // Third region: untouched.
        assert_eq!(alloc.regions[2].allocated, 0);

        // The next allocation is the first frame above the
        // bound.
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x12_000)));
    }

    #[test]
    fn test_reservation_partial_zone_bits() {
        // Reserving three frames leaves a partial zone word
        // with exactly the low three bits set.
        let mut alloc = allocator_for(&[(0x0, 0x100_000)]);
        alloc.reserve_up_to(PhysAddr::new(0x3000));

        assert_eq!(alloc.regions[0].bitmap.len(), 1);
        assert_eq!(alloc.regions[0].bitmap[0], 0b111);
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x3000)));
    }

    #[test]
    fn test_double_free_and_untracked_free() {
        let mut alloc = allocator_for(&[(0x0, 0x2000)]);

        let frame = alloc.alloc().unwrap();
        alloc.free(frame);
        assert_eq!(alloc.allocated_frames(), 0);

        // A second free of the same frame must not corrupt the
        // population count.
        alloc.free(frame);
        assert_eq!(alloc.allocated_frames(), 0);

        // Freeing an address in no region is a no-op.
        alloc.free(PhysAddr::new(0xdead_000));
        assert_eq!(alloc.allocated_frames(), 0);

        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x0)));
        assert_eq!(alloc.alloc(), Some(PhysAddr::new(0x1000)));
        assert_eq!(alloc.alloc(), None);
    }

    #[test]
    fn test_uniqueness_and_conservation() {
        // Drive the allocator with a deterministic mix of
        // allocations and frees, checking that no frame is
        // ever handed out twice and that the population count
        // matches the outstanding set.
        let mut alloc = allocator_for(&[(0x0, 0x40_000), (0x100_000, 0x140_000)]);
        let mut outstanding: Vec<PhysAddr> = Vec::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;

        for _ in 0..10_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);

            if seed % 3 == 0 && !outstanding.is_empty() {
                let victim = (seed >> 16) as usize % outstanding.len();
                alloc.free(outstanding.swap_remove(victim));
            } else if let Some(frame) = alloc.alloc() {
                assert!(
                    !outstanding.contains(&frame),
                    "frame {:?} allocated twice",
                    frame
                );
                outstanding.push(frame);
            }

            assert_eq!(alloc.allocated_frames(), outstanding.len());
        }

        // Release everything and check the allocator drains
        // back to empty.
        for frame in outstanding.drain(..) {
            alloc.free(frame);
        }
        assert_eq!(alloc.allocated_frames(), 0);
    }
}
