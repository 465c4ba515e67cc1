// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Core types for describing physical and virtual memory.
//!
//! This crate provides the address types shared by every memory
//! component:
//!
//! - [`PhysAddr`]: An address in the 52-bit physical address space.
//! - [`VirtAddr`]: A canonical address in the 48-bit virtual address space.
//!
//! It also fixes the constants of the kernel's address space layout:
//!
//! - [`PAGE_SIZE`]: The size of a page (and frame) of memory.
//! - [`KERNEL_OFFSET`]: The virtual address at which the first GiB of
//!   physical memory is mapped. [`phys_to_kernel`] converts a physical
//!   address within that window into a usable virtual address.
//!
//! The kernel binary, its stacks, the boot information block, and the
//! loader modules all live inside the `KERNEL_OFFSET` window, which is
//! established by the boot shim before `kmain` runs. The top level-4
//! slot is reserved for the page-table area (see the `virtmem` crate)
//! and must never hold ordinary mappings.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::wildcard_imports)]

use align::{align_down_usize, align_up_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// The size of a frame of physical memory and a page
/// of virtual memory.
///
pub const PAGE_SIZE: usize = 4096;

/// The virtual address at which the boot shim maps the
/// first GiB of physical memory.
///
pub const KERNEL_OFFSET: VirtAddr = VirtAddr::new(0xffff_8000_0000_0000);

/// The largest physical address reachable through the
/// [`KERNEL_OFFSET`] window.
///
const KERNEL_WINDOW_SIZE: usize = 1 << 30;

/// Returns the virtual address through which the given
/// physical address can be accessed.
///
/// This uses the fixed mapping of the first GiB of physical
/// memory at [`KERNEL_OFFSET`].
///
/// # Panics
///
/// `phys_to_kernel` panics if `phys` lies outside the mapped
/// window.
///
pub fn phys_to_kernel(phys: PhysAddr) -> VirtAddr {
    assert!(phys.as_usize() < KERNEL_WINDOW_SIZE);
    KERNEL_OFFSET + phys.as_usize()
}

/// A physical memory address.
///
/// A `PhysAddr` can only store an address that is valid on
/// x86-64: the top 12 bits are always zero.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(usize);

/// An invalid physical memory address.
///
/// Returned when an attempt is made to create a [`PhysAddr`]
/// from a value with any of the top 12 bits set, containing
/// the attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidPhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical memory address.
    ///
    /// # Panics
    ///
    /// `new` panics if `addr` has any of the top 12 bits set.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to PhysAddr::new"),
        }
    }

    /// Tries to create a new physical memory address, returning
    /// an error if the value is not valid.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidPhysAddr> {
        // Bits 52-63 must be unset (Intel x86-64 manual,
        // volume 1, section 3.2.1).
        if addr & 0xfff0_0000_0000_0000_usize == 0 {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the zero physical address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns whether this is the zero address.
    ///
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the largest page-aligned address that is no
    /// larger than this address.
    ///
    #[inline]
    pub const fn page_down(self) -> Self {
        PhysAddr(align_down_usize(self.0, PAGE_SIZE))
    }

    /// Returns the smallest page-aligned address that is no
    /// smaller than this address.
    ///
    #[inline]
    pub const fn page_up(self) -> Self {
        PhysAddr(align_up_usize(self.0, PAGE_SIZE))
    }

    /// Returns whether the address is aligned to a page
    /// boundary.
    ///
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Returns the address plus the given offset, unless the
    /// result would not be a valid physical address.
    ///
    #[inline]
    pub fn checked_add(self, offset: usize) -> Option<Self> {
        let sum = self.0.checked_add(offset)?;
        Self::try_new(sum).ok()
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    #[track_caller]
    fn add(self, other: usize) -> Self::Output {
        PhysAddr::new(self.0 + other)
    }
}

impl AddAssign<usize> for PhysAddr {
    #[track_caller]
    fn add_assign(&mut self, other: usize) {
        *self = *self + other;
    }
}

impl Sub<usize> for PhysAddr {
    type Output = PhysAddr;

    #[track_caller]
    fn sub(self, other: usize) -> Self::Output {
        PhysAddr::new(self.0 - other)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    fn sub(self, other: PhysAddr) -> Self::Output {
        self.0 - other.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual memory address.
///
/// A `VirtAddr` is always canonical: the top 16 bits are
/// equal to bit 47.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(usize);

/// An invalid virtual memory address.
///
/// Returned when an attempt is made to create a [`VirtAddr`]
/// from a non-canonical value, containing the attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidVirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual memory address.
    ///
    /// # Panics
    ///
    /// `new` panics if `addr` is not canonical.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to VirtAddr::new"),
        }
    }

    /// Tries to create a new virtual memory address, returning
    /// an error if the value is not canonical.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidVirtAddr> {
        // A canonical 48-bit address sign-extends bit 47,
        // so the top 17 bits are all zero or all one.
        match (addr & 0xffff_8000_0000_0000_usize) >> 47 {
            0 | 0x1ffff => Ok(VirtAddr(addr)),
            _ => Err(InvalidVirtAddr(addr)),
        }
    }

    /// Returns the zero virtual address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        VirtAddr(0)
    }

    /// Returns whether this is the zero address.
    ///
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the address of the given pointer.
    ///
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        VirtAddr::new(ptr as usize)
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a raw pointer.
    ///
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a raw mutable pointer.
    ///
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the largest page-aligned address that is no
    /// larger than this address.
    ///
    #[inline]
    pub const fn page_down(self) -> Self {
        VirtAddr(align_down_usize(self.0, PAGE_SIZE))
    }

    /// Returns the smallest page-aligned address that is no
    /// smaller than this address.
    ///
    /// # Panics
    ///
    /// `page_up` panics if the rounded address is not canonical.
    ///
    #[inline]
    pub const fn page_up(self) -> Self {
        VirtAddr::new(align_up_usize(self.0, PAGE_SIZE))
    }

    /// Returns whether the address is aligned to a page
    /// boundary.
    ///
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Returns the address plus the given offset, unless the
    /// result would not be canonical.
    ///
    #[inline]
    pub fn checked_add(self, offset: usize) -> Option<Self> {
        let sum = self.0.checked_add(offset)?;
        Self::try_new(sum).ok()
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    #[track_caller]
    fn add(self, other: usize) -> Self::Output {
        VirtAddr::new(self.0 + other)
    }
}

impl AddAssign<usize> for VirtAddr {
    #[track_caller]
    fn add_assign(&mut self, other: usize) {
        *self = *self + other;
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    #[track_caller]
    fn sub(self, other: usize) -> Self::Output {
        VirtAddr::new(self.0 - other)
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    fn sub(self, other: VirtAddr) -> Self::Output {
        self.0 - other.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
