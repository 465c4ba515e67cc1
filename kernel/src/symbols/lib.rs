// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Resolves kernel addresses to the function symbols containing them.
//!
//! The boot loader passes the kernel's ELF section headers through the
//! boot information block. [`init`] locates the symbol table section
//! and its linked string table; [`lookup`] then resolves any address
//! to the function symbol whose `[value, value + size)` range contains
//! it. The panic handler uses this to print a readable stack trace.
//!
//! Both tables are loader-provided memory, acquired once and read-only
//! for the life of the kernel. If the loader passed no symbols,
//! [`lookup`] simply always misses.

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]

use bootinfo::BootInfo;
use log::warn;
use memlayout::{phys_to_kernel, PhysAddr, VirtAddr};
use spin::Mutex;

/// Section type of an ELF symbol table.
const SHT_SYMTAB: u32 = 2;

/// Section type of an ELF string table.
const SHT_STRTAB: u32 = 3;

/// Symbol type of a function, in the low nibble of `st_info`.
const STT_FUNC: u8 = 2;

/// The size of one symbol table entry.
const SYMBOL_ENTRY_SIZE: usize = 24;

/// The kernel's symbol table, once [`init`] has found it.
///
static TABLE: Mutex<Option<SymbolTable<'static>>> = Mutex::new(None);

/// Locates the kernel's symbol and string tables in the boot
/// information.
///
/// Missing or malformed symbol data is logged and ignored;
/// the kernel runs fine without symbols, just with less
/// readable panics.
///
pub fn init(boot_info: &BootInfo<'static>) {
    let sections = match boot_info.elf_symbols() {
        Some(sections) => sections,
        None => {
            warn!("boot information carries no ELF symbols");
            return;
        }
    };

    // Find the symbol table section.
    let (symtab, link) = match (0..sections.count()).find_map(|i| {
        let header = SectionHeader::parse(sections.header(i)?)?;
        (header.kind == SHT_SYMTAB).then(|| (header, header.link))
    }) {
        Some(found) => found,
        None => {
            warn!("no symbol table section in ELF sections");
            return;
        }
    };

    // The symbol table links to its string table.
    let strtab = match sections
        .header(link as usize)
        .and_then(SectionHeader::parse)
    {
        Some(header) if header.kind == SHT_STRTAB => header,
        _ => {
            warn!("symbol table links to an invalid string table");
            return;
        }
    };

    let table = unsafe {
        SymbolTable {
            symbols: section_bytes(&symtab),
            strings: section_bytes(&strtab),
        }
    };

    *TABLE.lock() = Some(table);
}

/// Resolves `addr` to the function symbol containing it,
/// returning the symbol's name and starting address.
///
pub fn lookup(addr: VirtAddr) -> Option<(&'static str, usize)> {
    TABLE.lock().as_ref()?.lookup(addr.as_usize())
}

/// Returns whether a symbol table was found at boot.
///
pub fn available() -> bool {
    TABLE.lock().is_some()
}

/// One parsed ELF section header.
///
#[derive(Clone, Copy)]
struct SectionHeader {
    kind: u32,
    addr: usize,
    size: usize,
    link: u32,
}

impl SectionHeader {
    /// Parses the fields the kernel cares about out of a raw
    /// 64-byte ELF64 section header.
    ///
    fn parse(raw: &[u8]) -> Option<SectionHeader> {
        if raw.len() < 64 {
            return None;
        }

        Some(SectionHeader {
            kind: read_u32(raw, 4)?,
            addr: read_u64(raw, 16)? as usize,
            size: read_u64(raw, 32)? as usize,
            link: read_u32(raw, 40)?,
        })
    }
}

/// Returns the in-memory contents of a loaded section.
///
/// The loader records where it placed each section in
/// `sh_addr`. Physical addresses are reached through the
/// higher-half window; addresses that are already virtual are
/// used as they are.
///
/// # Safety
///
/// The section header must describe memory the loader actually
/// populated.
///
unsafe fn section_bytes(header: &SectionHeader) -> &'static [u8] {
    let virt = match PhysAddr::try_new(header.addr) {
        Ok(phys) if phys.as_usize() < (1 << 30) => phys_to_kernel(phys),
        _ => VirtAddr::new(header.addr),
    };

    core::slice::from_raw_parts(virt.as_ptr(), header.size)
}

/// A symbol table and its associated string table.
///
struct SymbolTable<'data> {
    symbols: &'data [u8],
    strings: &'data [u8],
}

impl<'data> SymbolTable<'data> {
    /// Scans for a function symbol whose range contains
    /// `addr`.
    ///
    fn lookup(&self, addr: usize) -> Option<(&'data str, usize)> {
        for raw in self.symbols.chunks_exact(SYMBOL_ENTRY_SIZE) {
            let name_offset = read_u32(raw, 0)? as usize;
            let info = raw[4];
            let value = read_u64(raw, 8)? as usize;
            let size = read_u64(raw, 16)? as usize;

            if info & 0xf != STT_FUNC || size == 0 {
                continue;
            }

            if value <= addr && addr < value + size {
                return Some((self.string_at(name_offset)?, value));
            }
        }

        None
    }

    /// Returns the NUL-terminated string at the given offset
    /// in the string table.
    ///
    fn string_at(&self, offset: usize) -> Option<&'data str> {
        let tail = self.strings.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&tail[..end]).ok()
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
