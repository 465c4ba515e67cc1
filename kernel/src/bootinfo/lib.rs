// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Parses the [multiboot2](https://www.gnu.org/software/grub/manual/multiboot2/multiboot.html) boot information block.
//!
//! The boot loader hands the kernel a magic value and the physical
//! address of an information block: a 32-bit total length, followed by
//! concatenated records. Each record starts with a 32-bit tag type and
//! a 32-bit byte length, and is padded to the next 8-byte boundary. A
//! record of type 0 terminates the list.
//!
//! [`BootInfo::load`] validates the magic value and takes a borrowed
//! view of the block through the higher-half window. [`BootInfo::find`]
//! scans for a record by type; the typed accessors ([`memory_map`](BootInfo::memory_map),
//! [`cmdline`](BootInfo::cmdline), [`modules`](BootInfo::modules),
//! [`framebuffer`](BootInfo::framebuffer), [`elf_symbols`](BootInfo::elf_symbols),
//! [`acpi_rsdp`](BootInfo::acpi_rsdp)) interpret the records the kernel
//! consumes.
//!
//! The view is read-only for the life of the kernel; nothing here
//! copies or mutates the loader's data.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

use core::str;
use memlayout::{phys_to_kernel, PhysAddr};

/// The magic value the loader passes alongside the info
/// block pointer.
///
pub const MULTIBOOT2_MAGIC: u32 = 0x36d7_6289;

/// The record types the kernel reads.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TagKind {
    End = 0,
    CmdLine = 1,
    LoaderName = 2,
    Module = 3,
    MemoryMap = 6,
    Framebuffer = 8,
    ElfSymbols = 9,
    AcpiOld = 14,
    AcpiNew = 15,
}

/// A borrowed view of the boot information block.
///
#[derive(Clone, Copy)]
pub struct BootInfo<'info> {
    data: &'info [u8],
}

/// A single record in the block. `payload` excludes the
/// 8-byte record header.
///
#[derive(Clone, Copy)]
pub struct Tag<'info> {
    pub kind: u32,
    pub payload: &'info [u8],
}

impl<'info> BootInfo<'info> {
    /// Takes a view of the boot information block handed over
    /// by the loader.
    ///
    /// # Panics
    ///
    /// `load` panics if `magic` does not match the well-known
    /// multiboot2 value, or if the block's length field is
    /// impossibly small.
    ///
    /// # Safety
    ///
    /// The caller must ensure `addr` is the address the loader
    /// provided and that the block it describes stays mapped and
    /// unmodified for the `'static` lifetime.
    ///
    pub unsafe fn load(magic: u32, addr: PhysAddr) -> BootInfo<'static> {
        if magic != MULTIBOOT2_MAGIC {
            panic!("bad multiboot magic");
        }

        let virt = phys_to_kernel(addr);
        let total_size = u32::from_le_bytes(*virt.as_ptr::<[u8; 4]>()) as usize;
        assert!(total_size >= 8, "boot information block too small");

        let data = core::slice::from_raw_parts(virt.as_ptr::<u8>(), total_size);
        BootInfo { data }
    }

    /// Takes a view of a boot information block held in an
    /// in-memory buffer.
    ///
    /// The buffer must start with the block's total-length field.
    ///
    pub fn from_bytes(data: &'info [u8]) -> Option<BootInfo<'info>> {
        if data.len() < 8 {
            return None;
        }

        let total_size = read_u32(data, 0)? as usize;
        if total_size < 8 || total_size > data.len() {
            return None;
        }

        Some(BootInfo {
            data: &data[..total_size],
        })
    }

    /// Returns the first record with the given type, or `None`.
    ///
    pub fn find(&self, kind: TagKind) -> Option<Tag<'info>> {
        self.tags().find(|tag| tag.kind == kind as u32)
    }

    /// Iterates over every record in the block, in order,
    /// stopping at the terminating record or at the first
    /// malformed one.
    ///
    pub fn tags(&self) -> impl Iterator<Item = Tag<'info>> + '_ {
        TagIter {
            data: self.data,
            offset: 8,
        }
    }

    /// Returns the boot command line, if the loader passed one.
    ///
    pub fn cmdline(&self) -> Option<&'info str> {
        self.find(TagKind::CmdLine).and_then(tag_str)
    }

    /// Returns the boot loader's name, if it recorded one.
    ///
    pub fn loader_name(&self) -> Option<&'info str> {
        self.find(TagKind::LoaderName).and_then(tag_str)
    }

    /// Returns the physical memory map.
    ///
    pub fn memory_map(&self) -> Option<MemoryMap<'info>> {
        let tag = self.find(TagKind::MemoryMap)?;
        let entry_size = read_u32(tag.payload, 0)? as usize;
        if entry_size < 24 {
            return None;
        }

        Some(MemoryMap {
            entry_size,
            entries: tag.payload.get(8..)?,
        })
    }

    /// Iterates over the modules the loader placed in memory.
    ///
    pub fn modules(&self) -> impl Iterator<Item = Module<'info>> + '_ {
        self.tags()
            .filter(|tag| tag.kind == TagKind::Module as u32)
            .filter_map(|tag| {
                Some(Module {
                    start: PhysAddr::new(read_u32(tag.payload, 0)? as usize),
                    end: PhysAddr::new(read_u32(tag.payload, 4)? as usize),
                    name: str_from_bytes(&tag.payload[8..]),
                })
            })
    }

    /// Returns the framebuffer description, if the loader set
    /// up a framebuffer.
    ///
    pub fn framebuffer(&self) -> Option<Framebuffer> {
        let tag = self.find(TagKind::Framebuffer)?;
        Some(Framebuffer {
            addr: PhysAddr::new(read_u64(tag.payload, 0)? as usize),
            pitch: read_u32(tag.payload, 8)?,
            width: read_u32(tag.payload, 12)?,
            height: read_u32(tag.payload, 16)?,
            bpp: *tag.payload.get(20)?,
            color_kind: *tag.payload.get(21)?,
        })
    }

    /// Returns the kernel's ELF section headers, as recorded
    /// by the loader.
    ///
    pub fn elf_symbols(&self) -> Option<ElfSections<'info>> {
        let tag = self.find(TagKind::ElfSymbols)?;
        let count = read_u32(tag.payload, 0)? as usize;
        let entry_size = read_u32(tag.payload, 4)? as usize;
        let shndx = read_u32(tag.payload, 8)? as usize;
        let headers = &tag.payload[12..];
        if entry_size == 0 || headers.len() < count * entry_size {
            return None;
        }

        Some(ElfSections {
            count,
            entry_size,
            shndx,
            headers,
        })
    }

    /// Returns the ACPI root pointer, validated against its
    /// signature and checksum.
    ///
    pub fn acpi_rsdp(&self) -> Option<Rsdp<'info>> {
        let tag = self
            .find(TagKind::AcpiNew)
            .or_else(|| self.find(TagKind::AcpiOld))?;

        Rsdp::parse(tag.payload)
    }
}

struct TagIter<'info> {
    data: &'info [u8],
    offset: usize,
}

impl<'info> Iterator for TagIter<'info> {
    type Item = Tag<'info>;

    fn next(&mut self) -> Option<Tag<'info>> {
        let kind = read_u32(self.data, self.offset)?;
        let size = read_u32(self.data, self.offset + 4)? as usize;
        if kind == TagKind::End as u32 || size < 8 {
            return None;
        }

        let payload = self.data.get(self.offset + 8..self.offset + size)?;

        // Records are padded to the next 8-byte boundary.
        self.offset += (size + 7) & !7;

        Some(Tag { kind, payload })
    }
}

/// The physical memory map provided by the firmware.
///
#[derive(Clone, Copy)]
pub struct MemoryMap<'info> {
    entry_size: usize,
    entries: &'info [u8],
}

/// A single entry in the memory map.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

impl MemoryMapEntry {
    /// The entry type marking memory as available for use.
    ///
    const AVAILABLE: u32 = 1;

    /// Returns whether the entry describes usable memory.
    ///
    pub fn is_available(&self) -> bool {
        self.kind == Self::AVAILABLE
    }
}

impl<'info> MemoryMap<'info> {
    /// Iterates over the entries in the map.
    ///
    pub fn entries(&self) -> impl Iterator<Item = MemoryMapEntry> + 'info {
        let entry_size = self.entry_size;
        let entries = self.entries;
        (0..entries.len() / entry_size).filter_map(move |i| {
            let off = i * entry_size;
            Some(MemoryMapEntry {
                base: read_u64(entries, off)?,
                length: read_u64(entries, off + 8)?,
                kind: read_u32(entries, off + 16)?,
            })
        })
    }
}

/// A module the loader placed in memory, such as an initial
/// ramdisk.
///
#[derive(Clone, Copy, Debug)]
pub struct Module<'info> {
    pub start: PhysAddr,
    pub end: PhysAddr,
    pub name: &'info str,
}

/// The framebuffer the loader configured.
///
#[derive(Clone, Copy, Debug)]
pub struct Framebuffer {
    pub addr: PhysAddr,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub color_kind: u8,
}

/// The kernel's ELF section headers, as passed through by the
/// loader.
///
#[derive(Clone, Copy)]
pub struct ElfSections<'info> {
    count: usize,
    entry_size: usize,
    shndx: usize,
    headers: &'info [u8],
}

impl<'info> ElfSections<'info> {
    /// Returns the number of section headers.
    ///
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the index of the section-name string table.
    ///
    pub fn shndx(&self) -> usize {
        self.shndx
    }

    /// Returns the raw bytes of section header `index`.
    ///
    pub fn header(&self, index: usize) -> Option<&'info [u8]> {
        if index >= self.count {
            return None;
        }

        let off = index * self.entry_size;
        self.headers.get(off..off + self.entry_size)
    }
}

/// A validated ACPI root system description pointer.
///
#[derive(Clone, Copy, Debug)]
pub struct Rsdp<'info> {
    pub oem_id: &'info str,
    pub revision: u8,
    pub rsdt_addr: u32,
}

impl<'info> Rsdp<'info> {
    const SIGNATURE: &'static [u8; 8] = b"RSD PTR ";

    /// The byte length covered by the version-1 checksum.
    ///
    const V1_LENGTH: usize = 20;

    fn parse(payload: &'info [u8]) -> Option<Rsdp<'info>> {
        if payload.len() < Self::V1_LENGTH || &payload[..8] != Self::SIGNATURE {
            return None;
        }

        // The bytes covered by the version-1 structure must
        // sum to zero.
        let sum = payload[..Self::V1_LENGTH]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return None;
        }

        Some(Rsdp {
            oem_id: str_from_bytes(&payload[9..15]),
            revision: payload[15],
            rsdt_addr: read_u32(payload, 16)?,
        })
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Returns the string in `data` up to its NUL terminator,
/// or the empty string if the bytes are not UTF-8.
///
fn str_from_bytes(data: &[u8]) -> &str {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    str::from_utf8(&data[..end]).unwrap_or("")
}

fn tag_str(tag: Tag) -> Option<&str> {
    Some(str_from_bytes(tag.payload))
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec::Vec;

    // Builds an info block out of (type, payload) records,
    // applying the header, padding and length rules the boot
    // loader follows.
    fn build_info(records: &[(u32, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0u8; 8]); // Total size, patched below.

        for (kind, payload) in records {
            data.extend_from_slice(&kind.to_le_bytes());
            data.extend_from_slice(&(8 + payload.len() as u32).to_le_bytes());
            data.extend_from_slice(payload);
            while data.len() % 8 != 0 {
                data.push(0);
            }
        }

        // Terminator record.
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());

        let total = data.len() as u32;
        data[0..4].copy_from_slice(&total.to_le_bytes());
        data
    }

    fn memory_map_payload(entries: &[(u64, u64, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&24u32.to_le_bytes()); // entry_size
        payload.extend_from_slice(&0u32.to_le_bytes()); // entry_version
        for (base, length, kind) in entries {
            payload.extend_from_slice(&base.to_le_bytes());
            payload.extend_from_slice(&length.to_le_bytes());
            payload.extend_from_slice(&kind.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
        }
        payload
    }

    #[test]
    fn test_find_and_strings() {
        let data = build_info(&[
            (TagKind::CmdLine as u32, b"console=ttyS0\0"),
            (TagKind::LoaderName as u32, b"GRUB 2.06\0"),
        ]);

        let info = BootInfo::from_bytes(&data).unwrap();
        assert_eq!(info.cmdline(), Some("console=ttyS0"));
        assert_eq!(info.loader_name(), Some("GRUB 2.06"));
        assert!(info.find(TagKind::MemoryMap).is_none());
    }

    #[test]
    fn test_memory_map() {
        let mmap = memory_map_payload(&[
            (0x0, 0x9fc00, 1),
            (0x9fc00, 0x400, 2),
            (0x10_0000, 0x10_0000, 1),
        ]);
        let data = build_info(&[(TagKind::MemoryMap as u32, &mmap)]);

        let info = BootInfo::from_bytes(&data).unwrap();
        let map = info.memory_map().unwrap();
        let entries: Vec<MemoryMapEntry> = map.entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].base, 0x0);
        assert_eq!(entries[0].length, 0x9fc00);
        assert!(entries[0].is_available());
        assert!(!entries[1].is_available());
        assert_eq!(entries[2].base, 0x10_0000);
        assert!(entries[2].is_available());
    }

    #[test]
    fn test_modules() {
        let mut module = Vec::new();
        module.extend_from_slice(&0x20_0000u32.to_le_bytes());
        module.extend_from_slice(&0x20_4000u32.to_le_bytes());
        module.extend_from_slice(b"initrd\0");

        let data = build_info(&[(TagKind::Module as u32, &module)]);
        let info = BootInfo::from_bytes(&data).unwrap();
        let modules: Vec<Module> = info.modules().collect();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].start, PhysAddr::new(0x20_0000));
        assert_eq!(modules[0].end, PhysAddr::new(0x20_4000));
        assert_eq!(modules[0].name, "initrd");
    }

    #[test]
    fn test_framebuffer() {
        let mut fb = Vec::new();
        fb.extend_from_slice(&0xfd00_0000u64.to_le_bytes());
        fb.extend_from_slice(&(1024u32 * 4).to_le_bytes());
        fb.extend_from_slice(&1024u32.to_le_bytes());
        fb.extend_from_slice(&768u32.to_le_bytes());
        fb.push(32); // bpp
        fb.push(1); // color kind
        fb.extend_from_slice(&0u16.to_le_bytes());

        let data = build_info(&[(TagKind::Framebuffer as u32, &fb)]);
        let info = BootInfo::from_bytes(&data).unwrap();
        let fb = info.framebuffer().unwrap();
        assert_eq!(fb.addr, PhysAddr::new(0xfd00_0000));
        assert_eq!(fb.pitch, 4096);
        assert_eq!(fb.width, 1024);
        assert_eq!(fb.height, 768);
        assert_eq!(fb.bpp, 32);
    }

    #[test]
    fn test_acpi_rsdp() {
        let mut rsdp = Vec::new();
        rsdp.extend_from_slice(b"RSD PTR ");
        rsdp.push(0); // checksum, patched below
        rsdp.extend_from_slice(b"LANTRN");
        rsdp.push(0); // revision
        rsdp.extend_from_slice(&0x7fe_0000u32.to_le_bytes());

        // Fix the checksum so the first 20 bytes sum to zero.
        let sum = rsdp.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        rsdp[8] = 0u8.wrapping_sub(sum);

        let data = build_info(&[(TagKind::AcpiOld as u32, &rsdp)]);
        let info = BootInfo::from_bytes(&data).unwrap();
        let rsdp = info.acpi_rsdp().unwrap();
        assert_eq!(rsdp.oem_id, "LANTRN");
        assert_eq!(rsdp.rsdt_addr, 0x7fe_0000);

        // A corrupted checksum must be rejected.
        let mut corrupt = Vec::new();
        corrupt.extend_from_slice(b"RSD PTR ");
        corrupt.push(0xab);
        corrupt.extend_from_slice(b"LANTRN");
        corrupt.push(0);
        corrupt.extend_from_slice(&0u32.to_le_bytes());

        let bad = build_info(&[(TagKind::AcpiOld as u32, &corrupt)]);
        let info = BootInfo::from_bytes(&bad).unwrap();
        assert!(info.acpi_rsdp().is_none());
    }

    #[test]
    fn test_truncated_block_rejected() {
        assert!(BootInfo::from_bytes(&[1, 2, 3]).is_none());

        // A length field larger than the buffer is rejected.
        let mut data = build_info(&[]);
        data[0..4].copy_from_slice(&0xffffu32.to_le_bytes());
        assert!(BootInfo::from_bytes(&data).is_none());
    }
}
