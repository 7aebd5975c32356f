// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Four-level x86-64 page tables with lazy allocation of intermediate
//! levels. Table pages come from the volatile kernel heap, which is
//! identity mapped, so a page's address doubles as the physical address
//! stored in the parent entry and in CR3.

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::pmem::flush;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Entries per table page.
const PT_ENTRIES: usize = 512;
/// Levels of the paging hierarchy (PML4 down to PT).
const LEVELS: usize = 4;
/// Physical-address bits of an entry.
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Attribute bits honoured in page-table entries.
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const NO_EXECUTE = 1 << 63;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address (or a range length) was not page aligned.
    Unaligned,
    /// Virtual address is outside the canonical 48-bit space.
    OutOfRange,
    /// Writable mappings must carry NO_EXECUTE.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
}

#[repr(align(4096))]
struct PageTablePage {
    entries: [u64; PT_ENTRIES],
}

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

/// Four-level page table allocating intermediate levels on demand.
pub struct PageTable {
    root: NonNull<PageTablePage>,
    owned: Vec<NonNull<PageTablePage>>,
}

impl PageTable {
    /// Creates an empty table with a fresh root page.
    pub fn new() -> Self {
        let root = Self::alloc_page();
        Self { root, owned: vec![root] }
    }

    /// Returns the physical address of the root page, suitable for CR3.
    pub fn root_paddr(&self) -> u64 {
        self.root.as_ptr() as u64
    }

    /// Looks up the raw leaf entry mapped at `va`, if present.
    pub fn lookup(&self, va: u64) -> Option<u64> {
        if va % PAGE_SIZE as u64 != 0 || !is_canonical(va) {
            return None;
        }
        let indices = table_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: table pages are owned by this PageTable.
            let entry = unsafe { (*table.as_ptr()).entries[*index] };
            if entry & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            if level == LEVELS - 1 {
                return Some(entry);
            }
            let next = (entry & ENTRY_ADDR_MASK) as *mut PageTablePage;
            table = NonNull::new(next)?;
        }
        None
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`. When
    /// `should_flush` is set, every touched entry's cache line is written
    /// back so the mapping survives in a durable table.
    pub fn map(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageFlags,
        should_flush: bool,
    ) -> Result<(), MapError> {
        if va % PAGE_SIZE as u64 != 0 || pa % PAGE_SIZE as u64 != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical(va) {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PageFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITABLE) && !flags.contains(PageFlags::NO_EXECUTE) {
            return Err(MapError::PermissionDenied);
        }

        let indices = table_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: table pages are owned by this PageTable.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if level == LEVELS - 1 {
                if *entry & PageFlags::PRESENT.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                *entry = (pa & ENTRY_ADDR_MASK) | flags.bits();
                if should_flush {
                    flush::clflush(entry as *const u64 as *const u8);
                }
                return Ok(());
            }

            if *entry & PageFlags::PRESENT.bits() != 0 {
                let next = (*entry & ENTRY_ADDR_MASK) as *mut PageTablePage;
                table = NonNull::new(next).ok_or(MapError::OutOfRange)?;
                continue;
            }

            let next = Self::alloc_page();
            self.owned.push(next);
            // Intermediate entries stay permissive; the leaf controls access.
            let inner = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
            *entry = (next.as_ptr() as u64 & ENTRY_ADDR_MASK) | inner.bits();
            if should_flush {
                flush::clflush(entry as *const u64 as *const u8);
            }
            table = next;
        }
        Ok(())
    }

    /// Maps the contiguous range `[va, va + size)` onto `[pa, pa + size)`.
    pub fn map_range(
        &mut self,
        va: u64,
        pa: u64,
        size: u64,
        flags: PageFlags,
        should_flush: bool,
    ) -> Result<(), MapError> {
        if size % PAGE_SIZE as u64 != 0 {
            return Err(MapError::Unaligned);
        }
        let mut offset = 0;
        while offset < size {
            self.map(va + offset, pa + offset, flags, should_flush)?;
            offset += PAGE_SIZE as u64;
        }
        Ok(())
    }

    fn alloc_page() -> NonNull<PageTablePage> {
        let boxed = Box::new(PageTablePage::new());
        // SAFETY: Box never yields a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer originates from `alloc_page` and is unique.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn table_indices(va: u64) -> [usize; LEVELS] {
    let pml4 = (va >> 39) & 0x1ff;
    let pdpt = (va >> 30) & 0x1ff;
    let pd = (va >> 21) & 0x1ff;
    let pt = (va >> 12) & 0x1ff;
    [pml4 as usize, pdpt as usize, pd as usize, pt as usize]
}

/// True when `va` is canonical for 48-bit virtual addressing.
pub fn is_canonical(va: u64) -> bool {
    let sign = (va >> 47) & 1;
    let upper = va >> 48;
    if sign == 0 {
        upper == 0
    } else {
        upper == u64::MAX >> 48
    }
}
