// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cold-start recovery of persistent processes
//! OWNERS: @kernel-pmem-team
//! STATUS: Functional
//! PUBLIC API: restore_processes, RecoveryStats, RecoveryError
//! DEPENDS_ON: pmem::PmemPool, ckpt::PersistentProcessInfo, mm::PageTable,
//!             task::ProcessTable, sched::Scheduler
//! INVARIANTS: A record is adopted only when its signature matches and
//!             its validity index is in range; rejected records are
//!             logged and left untouched for inspection
//! ADR: docs/adr/0001-persistent-process-model.md

extern crate alloc;

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::ckpt::{self, PersistentProcessInfo};
use crate::mm::PageTable;
use crate::pmem::{phys_to_ptr, PmemPool};
use crate::sched::{SchedError, Scheduler};
use crate::task::ProcessTable;
use crate::{log_error, log_info, log_warn};

/// Why a published record was rejected during recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryError {
    /// Signature matched but the validity index is out of range, or the
    /// committed snapshot is internally inconsistent.
    CorruptPmem,
}

/// Counters reported after walking the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub recovered: usize,
    pub skipped_bad_signature: usize,
    pub skipped_corrupt: usize,
    pub copied_bytes: u64,
}

/// Walks the pool's published records and registers a ready process for
/// every committed snapshot found. Scheduler saturation is fatal at
/// registration time and is propagated; malformed records are skipped
/// and left untouched so an operator can inspect them.
pub fn restore_processes(
    pool: &mut PmemPool,
    procs: &mut ProcessTable,
    scheduler: &mut Scheduler,
) -> Result<RecoveryStats, SchedError> {
    let mut stats = RecoveryStats::default();
    let records: Vec<u64> = pool.records().collect();
    for paddr in records {
        match adopt_record(paddr, &mut stats.copied_bytes, procs, scheduler)? {
            Adopt::Recovered => stats.recovered += 1,
            Adopt::BadSignature => stats.skipped_bad_signature += 1,
            Adopt::Rejected(RecoveryError::CorruptPmem) => stats.skipped_corrupt += 1,
        }
    }
    log_info!(
        target: "recovery",
        "recovered={} bad_signature={} corrupt={} copied={}B",
        stats.recovered,
        stats.skipped_bad_signature,
        stats.skipped_corrupt,
        stats.copied_bytes
    );
    Ok(stats)
}

/// Per-record outcome of the walk.
enum Adopt {
    Recovered,
    BadSignature,
    Rejected(RecoveryError),
}

/// Adopts one published record. The outer error is fatal scheduler
/// saturation; every other failure rejects just this record.
fn adopt_record(
    paddr: u64,
    copied_bytes: &mut u64,
    procs: &mut ProcessTable,
    scheduler: &mut Scheduler,
) -> Result<Adopt, SchedError> {
    let ptr = phys_to_ptr(paddr) as *mut PersistentProcessInfo;
    let Some(mut record_ptr) = NonNull::new(ptr) else {
        return Ok(Adopt::Rejected(RecoveryError::CorruptPmem));
    };
    // SAFETY: the pool descriptor published this address; recovery runs
    // single-threaded before any process owns the record.
    let record = unsafe { record_ptr.as_mut() };

    if !record.is_valid_signature() {
        log_warn!(target: "recovery", "record at 0x{:x}: signature mismatch, skipping", paddr);
        return Ok(Adopt::BadSignature);
    }

    let Some(valid) = record.valid_ctx_idx() else {
        log_error!(
            target: "recovery",
            "record at 0x{:x}: signature ok but validity index out of range (CORRUPT_PMEM)",
            paddr
        );
        return Ok(Adopt::Rejected(RecoveryError::CorruptPmem));
    };

    if !record.ctx(valid).map_info.ranges_disjoint() {
        log_error!(
            target: "recovery",
            "record at 0x{:x}: committed snapshot maps overlapping segments (CORRUPT_PMEM)",
            paddr
        );
        return Ok(Adopt::Rejected(RecoveryError::CorruptPmem));
    }

    // Rebuild one volatile root table per slot; the slots double-buffer
    // data and stack onto distinct physical pages.
    let mut tables: [Option<PageTable>; ckpt::NUM_CONTEXTS] = [None, None];
    for slot in 0..ckpt::NUM_CONTEXTS {
        let mut table = PageTable::new();
        if let Err(err) = record.ctx(slot).map_info.map_all(&mut table, true) {
            log_error!(
                target: "recovery",
                "record at 0x{:x}: slot {} failed to materialise: {:?} (CORRUPT_PMEM)",
                paddr,
                slot,
                err
            );
            return Ok(Adopt::Rejected(RecoveryError::CorruptPmem));
        }
        record.ctx_mut(slot).cpu.cr3 = table.root_paddr();
        tables[slot] = Some(table);
    }

    // The first dispatch enters the working slot, so bring it up to the
    // committed snapshot. The validity index is never touched here.
    if let Err(err) = record.prepare_resume(copied_bytes) {
        log_error!(
            target: "recovery",
            "record at 0x{:x}: resume preparation failed: {:?} (CORRUPT_PMEM)",
            paddr,
            err
        );
        return Ok(Adopt::Rejected(RecoveryError::CorruptPmem));
    }

    let pid = procs.create(Some(record_ptr), paddr, tables);
    scheduler.register_process(pid, procs)?;
    log_info!(
        target: "recovery",
        "record at 0x{:x} resumed as pid={} (valid slot {})",
        paddr,
        pid.raw(),
        valid
    );
    Ok(Adopt::Recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::PmemPool;
    use crate::task::{Pid, ProgramImage, Status};
    use crate::testutil::TestArena;

    /// Builds a pool holding one spawned persistent process, then drops
    /// every volatile handle, simulating a power cycle.
    fn populated_arena() -> (TestArena, u64) {
        let mut arena = TestArena::new(64);
        let record_paddr = {
            let mut pool = arena.pool();
            let mut procs = ProcessTable::new();
            let mut sched = Scheduler::new(&mut procs);
            let code = [0x90u8; 64];
            let image = ProgramImage::with_defaults(&code);
            let pid = procs
                .spawn_persistent(&mut pool, &mut sched, &image)
                .expect("spawn");
            procs.process(pid).expect("process").record_paddr()
        };
        (arena, record_paddr)
    }

    fn reboot(arena: &TestArena) -> (PmemPool, ProcessTable, Scheduler) {
        let (pool, recovered) =
            unsafe { PmemPool::open(arena.base(), arena.len()) }.expect("open");
        assert!(recovered);
        let mut procs = ProcessTable::new();
        let sched = Scheduler::new(&mut procs);
        (pool, procs, sched)
    }

    #[test]
    fn fresh_pool_leaves_only_the_root_process() {
        let mut arena = TestArena::new(16);
        let mut pool = arena.pool();
        let mut procs = ProcessTable::new();
        let mut sched = Scheduler::new(&mut procs);
        let stats = restore_processes(&mut pool, &mut procs, &mut sched).expect("restore");
        assert_eq!(stats, RecoveryStats::default());
        assert_eq!(sched.num_processes(), 1);
        assert_eq!(procs.len(), 1);
    }

    #[test]
    fn committed_record_is_resumed() {
        let (arena, record_paddr) = populated_arena();
        let (mut pool, mut procs, mut sched) = reboot(&arena);
        let stats = restore_processes(&mut pool, &mut procs, &mut sched).expect("restore");
        assert_eq!(stats.recovered, 1);
        assert_eq!(sched.num_processes(), 2);

        let pid = Pid::from_raw(1);
        let process = procs.process(pid).expect("recovered process");
        assert_eq!(process.status(), Status::Ready);
        assert_eq!(process.record_paddr(), record_paddr);

        let record = process.persistent().expect("record");
        let valid = record.valid_ctx().expect("valid ctx");
        // The snapshot resumes at the committed rip, and its code segment
        // is live in the rebuilt root table.
        assert_eq!(valid.cpu.int_frame.rip, crate::config::USER_CODE_BASE);
        let working = record.working_ctx().expect("working ctx");
        assert_eq!(working.cpu.int_frame.rip, valid.cpu.int_frame.rip);
        assert_ne!(valid.cpu.cr3, 0);
        assert_ne!(working.cpu.cr3, valid.cpu.cr3);
        let table = process.page_table(0).expect("rebuilt root table");
        assert_eq!(table.root_paddr(), valid.cpu.cr3);
        let code_entry = table
            .lookup(crate::config::USER_CODE_BASE)
            .expect("code segment mapped");
        assert_eq!(code_entry & 0x000f_ffff_ffff_f000, valid.map_info.code.paddr());
    }

    #[test]
    fn corrupt_signature_is_skipped_without_crashing() {
        let (arena, record_paddr) = populated_arena();
        {
            // Torch the signature the way a torn format would.
            // SAFETY: the arena owns this memory and nothing else
            // references the record between the two boots.
            let record =
                unsafe { &mut *(phys_to_ptr(record_paddr) as *mut PersistentProcessInfo) };
            record.clobber_signature();
        }
        let (mut pool, mut procs, mut sched) = reboot(&arena);
        let stats = restore_processes(&mut pool, &mut procs, &mut sched).expect("restore");
        assert_eq!(stats.recovered, 0);
        assert_eq!(stats.skipped_bad_signature, 1);
        assert_eq!(sched.num_processes(), 1);
    }

    #[test]
    fn out_of_range_validity_index_is_corrupt() {
        let (arena, record_paddr) = populated_arena();
        {
            let record =
                unsafe { &mut *(phys_to_ptr(record_paddr) as *mut PersistentProcessInfo) };
            // Reset to the uninitialised sentinel: signature stays valid.
            record.init();
        }
        let (mut pool, mut procs, mut sched) = reboot(&arena);
        let stats = restore_processes(&mut pool, &mut procs, &mut sched).expect("restore");
        assert_eq!(stats.recovered, 0);
        assert_eq!(stats.skipped_corrupt, 1);
        assert_eq!(sched.num_processes(), 1);
    }
}
