// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and persistent-process creation
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: ProcessTable (create/spawn_persistent), Process, Status,
//!             ProgramImage, SpawnError
//! DEPENDS_ON: ckpt::PersistentProcessInfo, mm::PageTable, pmem::PmemPool,
//!             sched::Scheduler
//! INVARIANTS: PID 0 is the root kernel process and never exits; a
//!             process's four virtual ranges are pairwise disjoint; the
//!             two slots of a record own distinct data/stack pages
//! ADR: docs/adr/0001-persistent-process-model.md

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::arch::x86_64::{RFLAGS_INTERRUPT_ENABLE, USER_CS, USER_SS};
use crate::log_debug;
use crate::ckpt::{self, PersistentProcessInfo, SegmentError};
use crate::config::{
    KERNEL_STACK_SIZE, USER_CODE_BASE, USER_DATA_BASE, USER_HEAP_BASE, USER_STACK_BASE,
};
use crate::mm::{MapError, PageTable, PAGE_SIZE};
use crate::pmem::{flush, phys_to_ptr, PmemError, PmemPool};
use crate::sched::{SchedError, Scheduler};

pub use crate::types::Pid;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotInitialized,
    Ready,
    Running,
    Sleeping,
    Killed,
}

/// Errors returned while creating a persistent process.
#[must_use = "spawn errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Image has no code or no stack.
    BadImage,
    /// The four virtual ranges of the image collide.
    Overlapping,
    /// Persistent pool could not back a segment or the record.
    Pmem(PmemError),
    /// Page-table materialisation failed.
    Map(MapError),
    /// Segment bring-up failed.
    Segment(SegmentError),
    /// Scheduler ring is saturated.
    Sched(SchedError),
}

impl From<PmemError> for SpawnError {
    fn from(value: PmemError) -> Self {
        Self::Pmem(value)
    }
}

impl From<MapError> for SpawnError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<SegmentError> for SpawnError {
    fn from(value: SegmentError) -> Self {
        Self::Segment(value)
    }
}

impl From<SchedError> for SpawnError {
    fn from(value: SchedError) -> Self {
        Self::Sched(value)
    }
}

/// Description of a user program to be instantiated as a persistent
/// process.
pub struct ProgramImage<'a> {
    pub code: &'a [u8],
    /// Entry point, relative to `code_vaddr`.
    pub entry_offset: u64,
    pub data_size: u64,
    pub stack_size: u64,
    pub heap_size: u64,
    pub code_vaddr: u64,
    pub data_vaddr: u64,
    pub stack_vaddr: u64,
    pub heap_vaddr: u64,
}

impl<'a> ProgramImage<'a> {
    /// Image with the default segment layout: one page of data, stack and
    /// heap each at the configured bases.
    pub fn with_defaults(code: &'a [u8]) -> Self {
        Self {
            code,
            entry_offset: 0,
            data_size: PAGE_SIZE as u64,
            stack_size: PAGE_SIZE as u64,
            heap_size: PAGE_SIZE as u64,
            code_vaddr: USER_CODE_BASE,
            data_vaddr: USER_DATA_BASE,
            stack_vaddr: USER_STACK_BASE,
            heap_vaddr: USER_HEAP_BASE,
        }
    }
}

#[repr(align(16))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

/// Runtime handle for one process.
pub struct Process {
    pid: Pid,
    status: Status,
    persistent: Option<NonNull<PersistentProcessInfo>>,
    record_paddr: u64,
    /// One volatile root table per context slot (the slots map distinct
    /// data/stack pages).
    page_tables: [Option<PageTable>; ckpt::NUM_CONTEXTS],
    exit_code: u64,
    num_ctx_switches: u64,
    copied_bytes: u64,
    flush_count: u64,
}

impl Process {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// True when this process carries a persistent record.
    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent.is_some()
    }

    #[inline]
    pub fn exit_code(&self) -> u64 {
        self.exit_code
    }

    #[inline]
    pub fn set_exit_code(&mut self, code: u64) {
        self.exit_code = code;
    }

    #[inline]
    pub fn record_paddr(&self) -> u64 {
        self.record_paddr
    }

    #[inline]
    pub fn num_ctx_switches(&self) -> u64 {
        self.num_ctx_switches
    }

    pub fn note_ctx_switch(&mut self) {
        self.num_ctx_switches += 1;
    }

    pub fn note_checkpoint(&mut self, copied_bytes: u64, flush_count: u64) {
        self.copied_bytes += copied_bytes;
        self.flush_count += flush_count;
    }

    #[inline]
    pub fn checkpoint_stats(&self) -> (u64, u64) {
        (self.copied_bytes, self.flush_count)
    }

    /// Root table backing one context slot, if the process owns one.
    pub fn page_table(&self, slot: usize) -> Option<&PageTable> {
        self.page_tables.get(slot).and_then(|table| table.as_ref())
    }

    /// Mutable access to the persistent record, if any.
    pub fn persistent_mut(&mut self) -> Option<&mut PersistentProcessInfo> {
        // SAFETY: the process exclusively owns its record; there is one
        // CPU and scheduler critical sections run with interrupts masked.
        self.persistent.map(|record| unsafe { &mut *record.as_ptr() })
    }

    /// Shared access to the persistent record, if any.
    pub fn persistent(&self) -> Option<&PersistentProcessInfo> {
        // SAFETY: see `persistent_mut`.
        self.persistent.map(|record| unsafe { &*record.as_ptr() })
    }
}

/// Owns every process; the scheduler only holds PIDs into this table.
pub struct ProcessTable {
    procs: Vec<Process>,
    current: Pid,
    // Pre-SMP contract: the table stays in the single kernel execution
    // context.
    _not_send_sync: PhantomData<*mut ()>,
}

impl ProcessTable {
    /// Creates a table seeded with the root kernel process (PID 0,
    /// Running, not persistent).
    pub fn new() -> Self {
        let root = Process {
            pid: Pid::ROOT,
            status: Status::Running,
            persistent: None,
            record_paddr: 0,
            page_tables: [None, None],
            exit_code: 0,
            num_ctx_switches: 0,
            copied_bytes: 0,
            flush_count: 0,
        };
        let mut procs = Vec::new();
        procs.push(root);
        Self { procs, current: Pid::ROOT, _not_send_sync: PhantomData }
    }

    #[inline]
    pub fn current_pid(&self) -> Pid {
        self.current
    }

    #[inline]
    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(pid.as_index())
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(pid.as_index())
    }

    pub fn current(&self) -> &Process {
        &self.procs[self.current.as_index()]
    }

    pub fn current_mut(&mut self) -> &mut Process {
        &mut self.procs[self.current.as_index()]
    }

    /// Adds a process wrapping an existing persistent record; used by the
    /// spawn path and by recovery. The process stays `NotInitialized`
    /// until the scheduler registers it.
    pub fn create(
        &mut self,
        persistent: Option<NonNull<PersistentProcessInfo>>,
        record_paddr: u64,
        page_tables: [Option<PageTable>; ckpt::NUM_CONTEXTS],
    ) -> Pid {
        let pid = Pid::from_raw(self.procs.len() as u32);
        self.procs.push(Process {
            pid,
            status: Status::NotInitialized,
            persistent,
            record_paddr,
            page_tables,
            exit_code: 0,
            num_ctx_switches: 0,
            copied_bytes: 0,
            flush_count: 0,
        });
        pid
    }

    /// Builds a persistent process from `image`: allocates the record and
    /// segments in the pool, populates both context slots, publishes the
    /// record, and registers the process with the scheduler.
    pub fn spawn_persistent(
        &mut self,
        pool: &mut PmemPool,
        scheduler: &mut Scheduler,
        image: &ProgramImage<'_>,
    ) -> Result<Pid, SpawnError> {
        let page = PAGE_SIZE as u64;
        if image.code.is_empty() || image.stack_size == 0 {
            return Err(SpawnError::BadImage);
        }

        let (mut record_ptr, record_paddr) = ckpt::allocate_record(pool)?;
        // SAFETY: freshly allocated record, not yet published or shared.
        let record = unsafe { record_ptr.as_mut() };

        let code_size = (image.code.len() as u64).div_ceil(page) * page;
        let data_size = image.data_size.div_ceil(page) * page;
        let stack_size = image.stack_size.div_ceil(page) * page;
        let heap_size = image.heap_size.div_ceil(page) * page;

        // Code is read-only and shared-identical between the two slots;
        // the heap backing is also shared, persisted by the user through
        // brk plus direct writes. Data and stack are double-buffered.
        let code_paddr = pool.alloc_pages_zeroed(code_size / page)?;
        // SAFETY: the range was just carved out of the arena.
        unsafe {
            core::ptr::copy_nonoverlapping(
                image.code.as_ptr(),
                phys_to_ptr(code_paddr),
                image.code.len(),
            );
        }
        let mut ignored = 0u64;
        flush::persist(phys_to_ptr(code_paddr) as *const u8, image.code.len(), &mut ignored);

        let heap_paddr = if heap_size > 0 {
            pool.alloc_pages_zeroed(heap_size / page)?
        } else {
            0
        };

        let kernel_stack = Box::leak(Box::new(KernelStack([0; KERNEL_STACK_SIZE])));
        let kernel_rsp = kernel_stack.0.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;

        let mut page_tables: [Option<PageTable>; ckpt::NUM_CONTEXTS] = [None, None];
        for slot in 0..ckpt::NUM_CONTEXTS {
            let ctx = record.ctx_mut(slot);
            ctx.map_info.code.set(image.code_vaddr, code_paddr, code_size);
            if heap_size > 0 {
                ctx.map_info.heap.set(image.heap_vaddr, heap_paddr, heap_size);
            }
            if data_size > 0 {
                ctx.map_info.data.set(image.data_vaddr, 0, data_size);
                ctx.map_info.data.alloc_from_pmem(pool)?;
            }
            ctx.map_info.stack.set(image.stack_vaddr, 0, stack_size);
            ctx.map_info.stack.alloc_from_pmem(pool)?;

            if !ctx.map_info.ranges_disjoint() {
                return Err(SpawnError::Overlapping);
            }

            let mut table = PageTable::new();
            ctx.map_info.map_all(&mut table, true)?;
            ctx.set_registers(
                image.code_vaddr + image.entry_offset,
                USER_CS,
                image.stack_vaddr + stack_size,
                USER_SS,
                table.root_paddr(),
                RFLAGS_INTERRUPT_ENABLE,
                kernel_rsp,
            );
            ctx.align_stack(16);
            page_tables[slot] = Some(table);
        }

        let mut flushes = 0u64;
        record.ctx(0).flush(&mut flushes);
        record.ctx(1).flush(&mut flushes);
        record.set_valid_ctx_idx(0);

        pool.publish_record(record_paddr)?;

        let pid = self.create(Some(record_ptr), record_paddr, page_tables);
        scheduler.register_process(pid, self)?;
        log_debug!(
            target: "task",
            "spawned persistent pid={} record=0x{:x} flushes={}",
            pid.raw(),
            record_paddr,
            flushes
        );
        Ok(pid)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
