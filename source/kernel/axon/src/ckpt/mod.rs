// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Persistent process records and the checkpoint engine
//! OWNERS: @kernel-pmem-team
//! STATUS: Functional
//! PUBLIC API: PersistentProcessInfo, ExecutionContext, SegmentMapping,
//!             ProcessMappingInfo, CkptError, RECORD_SIGNATURE
//! DEPENDS_ON: pmem::{PmemPool, flush}, mm::PageTable
//! INVARIANTS: The validity index only ever advances through a single
//!             flushed store (the commit point); the previously valid slot
//!             is untouched until after that store is durable
//! ADR: docs/adr/0001-persistent-process-model.md

pub mod context;
pub mod segment;

#[cfg(test)]
mod tests_prop;

use core::ptr::NonNull;

pub use context::{CpuContext, ExecutionContext, FpuContext, GeneralRegisters, HeapError,
                  InterruptFrame};
pub use segment::{ProcessMappingInfo, SegmentError, SegmentMapping};

use crate::mm::PAGE_SIZE;
use crate::pmem::{flush, phys_to_ptr, PmemError, PmemPool};

/// Number of execution-context slots per record; doubles as the sentinel
/// value of the validity index meaning "uninitialised".
pub const NUM_CONTEXTS: usize = 2;

/// Magic identifying a persistent process record in the pool.
pub const RECORD_SIGNATURE: u64 = 0x4F50_534F_6D75_696C;

/// Errors reported by the checkpoint engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CkptError {
    /// The validity index still holds the sentinel; no checkpoint exists.
    Uninitialized,
    /// Re-synchronising the working slot after commit failed.
    Resync(SegmentError),
}

/// The atomic durable unit of recovery: two execution-context slots, the
/// index of the authoritative one, and a signature.
#[repr(C)]
pub struct PersistentProcessInfo {
    ctx: [ExecutionContext; NUM_CONTEXTS],
    valid_ctx_idx: u32,
    signature: u64,
}

impl PersistentProcessInfo {
    /// Pages needed to hold one record.
    pub fn record_pages() -> u64 {
        (core::mem::size_of::<Self>() as u64).div_ceil(PAGE_SIZE as u64)
    }

    /// Two-phase initialisation of a zeroed record: sentinel first, then
    /// the signature, each flushed. The record only becomes reachable
    /// once its pointer is published in the pool descriptor.
    pub fn init(&mut self) {
        flush::store(&mut self.valid_ctx_idx, NUM_CONTEXTS as u32);
        flush::store(&mut self.signature, RECORD_SIGNATURE);
    }

    /// True when the signature matches.
    pub fn is_valid_signature(&self) -> bool {
        self.signature == RECORD_SIGNATURE
    }

    /// Index of the authoritative slot, or `None` while the sentinel (or
    /// garbage) is stored.
    pub fn valid_ctx_idx(&self) -> Option<usize> {
        match self.valid_ctx_idx {
            idx @ 0..=1 => Some(idx as usize),
            _ => None,
        }
    }

    pub fn ctx(&self, idx: usize) -> &ExecutionContext {
        &self.ctx[idx]
    }

    pub fn ctx_mut(&mut self, idx: usize) -> &mut ExecutionContext {
        &mut self.ctx[idx]
    }

    /// The authoritative snapshot.
    pub fn valid_ctx(&self) -> Result<&ExecutionContext, CkptError> {
        let idx = self.valid_ctx_idx().ok_or(CkptError::Uninitialized)?;
        Ok(&self.ctx[idx])
    }

    /// The slot accumulating new work.
    pub fn working_ctx(&self) -> Result<&ExecutionContext, CkptError> {
        let idx = self.valid_ctx_idx().ok_or(CkptError::Uninitialized)?;
        Ok(&self.ctx[1 - idx])
    }

    /// Mutable access to the slot accumulating new work.
    pub fn working_ctx_mut(&mut self) -> Result<&mut ExecutionContext, CkptError> {
        let idx = self.valid_ctx_idx().ok_or(CkptError::Uninitialized)?;
        Ok(&mut self.ctx[1 - idx])
    }

    /// Durable store of the validity index.
    pub fn set_valid_ctx_idx(&mut self, idx: usize) {
        debug_assert!(idx < NUM_CONTEXTS);
        flush::store(&mut self.valid_ctx_idx, idx as u32);
    }

    /// Promotes the working slot to the valid one.
    ///
    /// 1. Flush the working slot so every store it accumulated is durable.
    /// 2. Advance the validity index with a single flushed store. A crash
    ///    before this flush leaves the old slot authoritative; after it,
    ///    the new one. This is the commit point.
    /// 3. Copy the committed context back into the now-working slot so the
    ///    next interval starts from a known-good image.
    pub fn switch_context(
        &mut self,
        copied_bytes: &mut u64,
        flush_count: &mut u64,
    ) -> Result<(), CkptError> {
        let valid = self.valid_ctx_idx().ok_or(CkptError::Uninitialized)?;
        let working = 1 - valid;

        self.ctx[working].flush(flush_count);

        flush::store(&mut self.valid_ctx_idx, working as u32);
        *flush_count += 1;

        let (low, high) = self.ctx.split_at_mut(1);
        let (next_working, committed) = if valid == 0 {
            (&mut low[0], &high[0])
        } else {
            (&mut high[0], &low[0])
        };
        next_working
            .copy_context_from(committed, copied_bytes)
            .map_err(CkptError::Resync)?;
        Ok(())
    }

    /// Test-only fault injection: forges a bogus signature in place.
    #[cfg(test)]
    pub fn clobber_signature(&mut self) {
        flush::store(&mut self.signature, !RECORD_SIGNATURE);
    }

    /// Test-only: address of the cache line holding the validity index,
    /// used by crash tests to locate the commit point in a flush journal.
    #[cfg(test)]
    pub fn valid_idx_line_addr(&self) -> usize {
        (core::ptr::addr_of!(self.valid_ctx_idx) as usize) & !(flush::CACHE_LINE_SIZE - 1)
    }

    /// Recovery-side resynchronisation: brings the working slot up to the
    /// committed snapshot without touching the validity index.
    pub fn prepare_resume(&mut self, copied_bytes: &mut u64) -> Result<(), CkptError> {
        let valid = self.valid_ctx_idx().ok_or(CkptError::Uninitialized)?;
        let (low, high) = self.ctx.split_at_mut(1);
        let (working, committed) = if valid == 0 {
            (&mut high[0], &low[0])
        } else {
            (&mut low[0], &high[0])
        };
        working
            .copy_context_from(committed, copied_bytes)
            .map_err(CkptError::Resync)?;
        Ok(())
    }
}

/// Allocates a zeroed record in the pool and runs its two-phase init.
/// The caller publishes the returned address once the record's contexts
/// are populated.
pub fn allocate_record(
    pool: &mut PmemPool,
) -> Result<(NonNull<PersistentProcessInfo>, u64), PmemError> {
    let paddr = pool.alloc_pages_zeroed(PersistentProcessInfo::record_pages())?;
    let ptr = phys_to_ptr(paddr) as *mut PersistentProcessInfo;
    // SAFETY: freshly allocated, zeroed, page-aligned, exclusively owned.
    let mut record = unsafe { NonNull::new_unchecked(ptr) };
    // SAFETY: see above; the record is not yet shared.
    unsafe { record.as_mut() }.init();
    Ok((record, paddr))
}
