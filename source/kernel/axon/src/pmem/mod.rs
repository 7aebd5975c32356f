// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Persistent-memory pool: durable descriptor plus page allocator
//! OWNERS: @kernel-pmem-team
//! STATUS: Functional
//! PUBLIC API: PmemPool, PmemError, POOL_SIGNATURE, phys_to_ptr
//! DEPENDS_ON: pmem::flush, mm::PAGE_SIZE
//! INVARIANTS: Descriptor mutations are flushed before the result is
//!             observable; allocations never overlap; the signature is
//!             written last when formatting (two-phase publication)
//! ADR: docs/adr/0001-persistent-process-model.md

pub mod flush;

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::mm::PAGE_SIZE;

/// Magic identifying a formatted pool descriptor.
pub const POOL_SIGNATURE: u64 = 0x4F50_534F_6D75_696C;

/// Capacity of the descriptor's persistent-process record table.
pub const PROC_RECORD_SLOTS: usize = 16;

/// Errors reported by the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmemError {
    /// The arena cannot satisfy the requested number of pages.
    Exhausted,
    /// The record table has no free slot left.
    RecordTableFull,
    /// The provided region is too small or misaligned to hold a pool.
    BadRegion,
}

/// Converts a pool physical address into a dereferenceable pointer.
///
/// The kernel maps persistent memory through an identity window, so the
/// physical address doubles as the linear address. Host builds hand in
/// arena addresses that already satisfy this.
#[inline]
pub fn phys_to_ptr(paddr: u64) -> *mut u8 {
    paddr as usize as *mut u8
}

/// Durable pool descriptor living in the first page of the region.
#[repr(C)]
struct PoolDescriptor {
    signature: u64,
    /// Physical address of the next unallocated byte (page aligned).
    free_next: u64,
    /// One past the last byte of the arena.
    pool_end: u64,
    /// Published `PersistentProcessInfo` records; zero means empty.
    proc_records: [u64; PROC_RECORD_SLOTS],
}

const_assert!(core::mem::size_of::<PoolDescriptor>() <= PAGE_SIZE);

/// Handle to a formatted persistent pool.
#[derive(Debug)]
pub struct PmemPool {
    descriptor: NonNull<PoolDescriptor>,
}

impl PmemPool {
    /// Formats a fresh pool over `[base, base + size)` and returns a
    /// handle to it. The signature is stored only after the rest of the
    /// descriptor is durable, so a torn format is never mistaken for a
    /// valid pool.
    ///
    /// # Safety
    ///
    /// The region must be persistent memory reachable through the
    /// identity window, page aligned, and exclusively owned by the
    /// caller.
    pub unsafe fn format(base: u64, size: u64) -> Result<Self, PmemError> {
        let page = PAGE_SIZE as u64;
        if base % page != 0 || size < 2 * page {
            return Err(PmemError::BadRegion);
        }
        let descriptor = phys_to_ptr(base) as *mut PoolDescriptor;
        // SAFETY: in-bounds, exclusively owned, properly aligned.
        let descriptor = unsafe { &mut *descriptor };
        flush::store(&mut descriptor.signature, 0);
        flush::store(&mut descriptor.free_next, base + page);
        flush::store(&mut descriptor.pool_end, base + size);
        for slot in descriptor.proc_records.iter_mut() {
            flush::store(slot, 0);
        }
        flush::store(&mut descriptor.signature, POOL_SIGNATURE);
        Ok(Self { descriptor: NonNull::from(descriptor) })
    }

    /// Adopts an existing pool when the signature matches, formatting a
    /// fresh one otherwise. The boolean reports whether durable state was
    /// found.
    ///
    /// # Safety
    ///
    /// Same contract as [`PmemPool::format`].
    pub unsafe fn open(base: u64, size: u64) -> Result<(Self, bool), PmemError> {
        let page = PAGE_SIZE as u64;
        if base % page != 0 || size < 2 * page {
            return Err(PmemError::BadRegion);
        }
        let descriptor = phys_to_ptr(base) as *mut PoolDescriptor;
        // SAFETY: guaranteed by the caller.
        let existing = unsafe { &*descriptor };
        if existing.signature == POOL_SIGNATURE {
            // SAFETY: the descriptor pointer is valid for the pool's life.
            let pool = Self { descriptor: unsafe { NonNull::new_unchecked(descriptor) } };
            return Ok((pool, true));
        }
        // SAFETY: guaranteed by the caller.
        let pool = unsafe { Self::format(base, size)? };
        Ok((pool, false))
    }

    fn descriptor(&self) -> &PoolDescriptor {
        // SAFETY: the descriptor outlives the pool handle.
        unsafe { self.descriptor.as_ref() }
    }

    fn descriptor_mut(&mut self) -> &mut PoolDescriptor {
        // SAFETY: exclusive access through `&mut self`.
        unsafe { &mut *self.descriptor.as_ptr() }
    }

    /// Allocates `n_pages` page-aligned pages from the arena. Successive
    /// allocations never overlap; the bumped free pointer is durable
    /// before the address is returned.
    pub fn alloc_pages(&mut self, n_pages: u64) -> Result<u64, PmemError> {
        let bytes = n_pages
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(PmemError::Exhausted)?;
        if bytes == 0 {
            return Err(PmemError::Exhausted);
        }
        let descriptor = self.descriptor_mut();
        let paddr = descriptor.free_next;
        let next = paddr.checked_add(bytes).ok_or(PmemError::Exhausted)?;
        if next > descriptor.pool_end {
            return Err(PmemError::Exhausted);
        }
        flush::store(&mut descriptor.free_next, next);
        Ok(paddr)
    }

    /// Allocates pages and scrubs them to zero, flushing the zeroes so a
    /// two-phase initialiser starts from a durable blank slate.
    pub fn alloc_pages_zeroed(&mut self, n_pages: u64) -> Result<u64, PmemError> {
        let paddr = self.alloc_pages(n_pages)?;
        let len = (n_pages * PAGE_SIZE as u64) as usize;
        // SAFETY: the range was just carved out of the arena.
        unsafe { core::ptr::write_bytes(phys_to_ptr(paddr), 0, len) };
        let mut ignored = 0u64;
        flush::persist(phys_to_ptr(paddr) as *const u8, len, &mut ignored);
        Ok(paddr)
    }

    /// Returns the most recent allocation to the arena. Only the last
    /// allocation can be taken back; anything else is a durable no-op,
    /// since general PMEM reclamation is out of scope.
    pub fn release_pages(&mut self, paddr: u64, n_pages: u64) {
        let bytes = n_pages * PAGE_SIZE as u64;
        let descriptor = self.descriptor_mut();
        if paddr + bytes == descriptor.free_next {
            flush::store(&mut descriptor.free_next, paddr);
        }
    }

    /// Publishes a `PersistentProcessInfo` record. The single durable
    /// pointer store is what makes the record visible to recovery.
    pub fn publish_record(&mut self, paddr: u64) -> Result<usize, PmemError> {
        let descriptor = self.descriptor_mut();
        for (index, slot) in descriptor.proc_records.iter_mut().enumerate() {
            if *slot == 0 {
                flush::store(slot, paddr);
                return Ok(index);
            }
        }
        Err(PmemError::RecordTableFull)
    }

    /// Withdraws a published record (used when a spawn fails after
    /// publication).
    #[allow(dead_code)]
    pub fn retire_record(&mut self, index: usize) {
        let descriptor = self.descriptor_mut();
        if let Some(slot) = descriptor.proc_records.get_mut(index) {
            flush::store(slot, 0);
        }
    }

    /// Iterates over the published record addresses.
    pub fn records(&self) -> impl Iterator<Item = u64> + '_ {
        self.descriptor()
            .proc_records
            .iter()
            .copied()
            .filter(|&paddr| paddr != 0)
    }

    /// Pages still available in the arena.
    pub fn remaining_pages(&self) -> u64 {
        let descriptor = self.descriptor();
        (descriptor.pool_end - descriptor.free_next) / PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::testutil::TestArena;

    #[test]
    fn format_rejects_undersized_regions() {
        let arena = TestArena::new(4);
        let err = unsafe { PmemPool::format(arena.base(), PAGE_SIZE as u64) }.unwrap_err();
        assert_eq!(err, PmemError::BadRegion);
    }

    #[test]
    fn allocations_never_overlap() {
        let mut arena = TestArena::new(8);
        let mut pool = arena.pool();
        let a = pool.alloc_pages(2).expect("first");
        let b = pool.alloc_pages(1).expect("second");
        assert_eq!(b, a + 2 * PAGE_SIZE as u64);
        assert_eq!(a % PAGE_SIZE as u64, 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = TestArena::new(4);
        let mut pool = arena.pool();
        // One page is the descriptor, three remain.
        assert!(pool.alloc_pages(3).is_ok());
        assert_eq!(pool.alloc_pages(1), Err(PmemError::Exhausted));
    }

    #[test]
    fn release_rolls_back_only_the_last_allocation() {
        let mut arena = TestArena::new(8);
        let mut pool = arena.pool();
        let a = pool.alloc_pages(1).expect("a");
        let b = pool.alloc_pages(1).expect("b");
        let before = pool.remaining_pages();
        pool.release_pages(a, 1);
        assert_eq!(pool.remaining_pages(), before);
        pool.release_pages(b, 1);
        assert_eq!(pool.remaining_pages(), before + 1);
    }

    #[test]
    fn open_adopts_existing_descriptor() {
        let mut arena = TestArena::new(8);
        let record = {
            let mut pool = arena.pool();
            let paddr = pool.alloc_pages(1).expect("record page");
            pool.publish_record(paddr).expect("publish");
            paddr
        };
        let (pool, recovered) =
            unsafe { PmemPool::open(arena.base(), arena.len()) }.expect("open");
        assert!(recovered);
        let records: Vec<u64> = pool.records().collect();
        assert_eq!(records, vec![record]);
    }

    #[test]
    fn open_formats_when_signature_missing() {
        let arena = TestArena::new(8);
        let (pool, recovered) =
            unsafe { PmemPool::open(arena.base(), arena.len()) }.expect("open");
        assert!(!recovered);
        assert_eq!(pool.records().count(), 0);
    }
}
