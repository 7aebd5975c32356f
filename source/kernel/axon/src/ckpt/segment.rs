// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable segment records: a contiguous virtual range backed 1:1 by a
//! contiguous physical range in persistent memory.

use crate::mm::{MapError, PageFlags, PageTable, PAGE_SIZE};
use crate::pmem::{flush, phys_to_ptr, PmemError, PmemPool};

/// Errors reported by segment operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentError {
    /// Segment has no physical backing.
    Unbacked,
    /// Destination segment is smaller than the source.
    Capacity,
    /// Stack manipulation would leave the stack segment's range.
    StackExhausted,
}

/// Three durable words tying `[vaddr, vaddr + map_size)` to
/// `[paddr, paddr + map_size)`.
///
/// Invariant: either all three words are zero (unused) or `paddr != 0`,
/// `map_size > 0` and `map_size` is page-multiple.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SegmentMapping {
    vaddr: u64,
    paddr: u64,
    map_size: u64,
}

impl SegmentMapping {
    pub const fn zeroed() -> Self {
        Self { vaddr: 0, paddr: 0, map_size: 0 }
    }

    /// Assigns all three words, then writes the record back so the triple
    /// becomes durable as a unit.
    pub fn set(&mut self, vaddr: u64, paddr: u64, map_size: u64) {
        self.vaddr = vaddr;
        self.paddr = paddr;
        self.map_size = map_size;
        let mut ignored = 0u64;
        flush::persist(
            self as *const Self as *const u8,
            core::mem::size_of::<Self>(),
            &mut ignored,
        );
    }

    /// Stores zeroes and flushes.
    pub fn clear(&mut self) {
        self.set(0, 0, 0);
    }

    #[inline]
    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    #[inline]
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    #[inline]
    pub fn map_size(&self) -> u64 {
        self.map_size
    }

    #[inline]
    pub fn virt_end(&self) -> u64 {
        self.vaddr + self.map_size
    }

    #[inline]
    pub fn is_unbacked(&self) -> bool {
        self.paddr == 0
    }

    /// Durable update of the physical base alone.
    pub fn set_paddr(&mut self, paddr: u64) {
        flush::store(&mut self.paddr, paddr);
    }

    /// Draws `map_size` bytes from the persistent pool and records the
    /// resulting physical base.
    pub fn alloc_from_pmem(&mut self, pool: &mut PmemPool) -> Result<(), PmemError> {
        let pages = self.map_size.div_ceil(PAGE_SIZE as u64);
        let paddr = pool.alloc_pages_zeroed(pages)?;
        self.set_paddr(paddr);
        Ok(())
    }

    /// Copies `src`'s contents into this segment, writing back each
    /// destination cache line as it lands. Requires both segments backed
    /// and this one at least as large as the source. Bytes copied are
    /// added to `copied_bytes`.
    pub fn copy_data_from(
        &mut self,
        src: &SegmentMapping,
        copied_bytes: &mut u64,
    ) -> Result<(), SegmentError> {
        if self.paddr == 0 || src.paddr == 0 {
            return Err(SegmentError::Unbacked);
        }
        if self.map_size < src.map_size {
            return Err(SegmentError::Capacity);
        }
        let len = src.map_size as usize;
        let src_ptr = phys_to_ptr(src.paddr) as *const u8;
        let dst_ptr = phys_to_ptr(self.paddr);
        let mut offset = 0usize;
        while offset < len {
            let chunk = core::cmp::min(flush::CACHE_LINE_SIZE, len - offset);
            // SAFETY: both ranges are inside segments this record and
            // `src` exclusively own; they never alias.
            unsafe {
                core::ptr::copy_nonoverlapping(src_ptr.add(offset), dst_ptr.add(offset), chunk);
                flush::clflush(dst_ptr.add(offset) as *const u8);
            }
            offset += chunk;
        }
        *copied_bytes += src.map_size;
        Ok(())
    }

    /// Installs page-table entries for the whole segment with the given
    /// attributes plus PRESENT. A null segment is skipped.
    pub fn map_into(
        &self,
        table: &mut PageTable,
        attrs: PageFlags,
        should_flush: bool,
    ) -> Result<(), MapError> {
        if self.is_unbacked() {
            return Ok(());
        }
        table.map_range(
            self.vaddr,
            self.paddr,
            self.map_size,
            attrs | PageFlags::PRESENT,
            should_flush,
        )
    }

    /// Forces every cache line of the physical range back to persistent
    /// memory, counting the flushes.
    pub fn flush(&self, flush_count: &mut u64) {
        if self.is_unbacked() {
            return;
        }
        flush::persist(
            phys_to_ptr(self.paddr) as *const u8,
            self.map_size as usize,
            flush_count,
        );
    }

    /// True when the virtual ranges of the two segments intersect. Unused
    /// segments never overlap anything.
    pub fn overlaps(&self, other: &SegmentMapping) -> bool {
        if self.map_size == 0 || other.map_size == 0 {
            return false;
        }
        self.vaddr < other.virt_end() && other.vaddr < self.virt_end()
    }
}

/// The four segments describing one address space.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessMappingInfo {
    pub code: SegmentMapping,
    pub data: SegmentMapping,
    pub stack: SegmentMapping,
    pub heap: SegmentMapping,
}

impl ProcessMappingInfo {
    pub const fn zeroed() -> Self {
        Self {
            code: SegmentMapping::zeroed(),
            data: SegmentMapping::zeroed(),
            stack: SegmentMapping::zeroed(),
            heap: SegmentMapping::zeroed(),
        }
    }

    pub fn clear(&mut self) {
        self.code.clear();
        self.data.clear();
        self.stack.clear();
        self.heap.clear();
    }

    /// Writes back the mutable segments. Code is immutable after load and
    /// needs no sweep.
    pub fn flush(&self, flush_count: &mut u64) {
        self.data.flush(flush_count);
        self.stack.flush(flush_count);
        self.heap.flush(flush_count);
    }

    /// Materialises all four segments into `table` with the per-segment
    /// attribute policy: code executes read-only, everything else is
    /// writable and never executable.
    pub fn map_all(&self, table: &mut PageTable, should_flush: bool) -> Result<(), MapError> {
        let user_rx = PageFlags::USER;
        let user_rw = PageFlags::USER | PageFlags::WRITABLE | PageFlags::NO_EXECUTE;
        self.code.map_into(table, user_rx, should_flush)?;
        self.data.map_into(table, user_rw, should_flush)?;
        self.stack.map_into(table, user_rw, should_flush)?;
        self.heap.map_into(table, user_rw, should_flush)?;
        Ok(())
    }

    /// True when the four virtual ranges are pairwise disjoint.
    pub fn ranges_disjoint(&self) -> bool {
        let segments = [&self.code, &self.data, &self.stack, &self.heap];
        for (i, a) in segments.iter().enumerate() {
            for b in segments.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return false;
                }
            }
        }
        true
    }
}
