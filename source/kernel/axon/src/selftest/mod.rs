// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-kernel selftest harness executed during boot when the `selftest`
//! feature is enabled. These run against the live pool: pages drawn here
//! stay allocated, which is acceptable once per deliberately booted test
//! image.

pub mod assert;

use crate::ckpt::{self, HeapError};
use crate::mm::{PageTable, PAGE_SIZE};
use crate::pmem::PmemPool;
use crate::sched::Scheduler;
use crate::task::ProcessTable;
use crate::uart;
use crate::{st_assert, st_expect_eq, st_expect_err};

/// Borrowed references to the kernel subsystems under test.
pub struct Context<'a> {
    pub pool: &'a mut PmemPool,
    #[allow(dead_code)]
    pub procs: &'a mut ProcessTable,
    pub scheduler: &'a mut Scheduler,
}

/// Runs every selftest in order, panicking on the first failure.
pub fn entry(ctx: &mut Context<'_>) {
    uart::write_line("SELFTEST: begin");
    pool_allocation(ctx);
    heap_bounds(ctx);
    checkpoint_commit(ctx);
    scheduler_shape(ctx);
    uart::write_line("SELFTEST: ok");
}

fn pool_allocation(ctx: &mut Context<'_>) {
    let first = ctx.pool.alloc_pages(1);
    st_assert!(first.is_ok(), "pool refused a single page");
    let second = ctx.pool.alloc_pages(1);
    st_assert!(second.is_ok());
    if let (Ok(a), Ok(b)) = (first, second) {
        st_expect_eq!(b, a + PAGE_SIZE as u64);
    }
}

fn heap_bounds(ctx: &mut Context<'_>) {
    let page = PAGE_SIZE as u64;
    let Ok((mut record_ptr, _)) = ckpt::allocate_record(ctx.pool) else {
        assert::report_failure("record allocation failed");
    };
    // SAFETY: freshly allocated record, unpublished and exclusively ours.
    let record = unsafe { record_ptr.as_mut() };
    let ctx0 = record.ctx_mut(0);
    ctx0.map_info.heap.set(0x7000_0000, 0, page);
    if ctx0.map_info.heap.alloc_from_pmem(ctx.pool).is_err() {
        assert::report_failure("heap backing allocation failed");
    }
    st_expect_eq!(ctx0.expand_heap(page as i64), Ok(0x7000_0000 + page));
    st_expect_err!(ctx0.expand_heap(1), HeapError::Overflow);
    st_expect_eq!(ctx0.heap_used_size(), page);
    st_expect_err!(ctx0.expand_heap(-(page as i64) - 1), HeapError::Underflow);
}

fn checkpoint_commit(ctx: &mut Context<'_>) {
    let page = PAGE_SIZE as u64;
    let Ok((mut record_ptr, _)) = ckpt::allocate_record(ctx.pool) else {
        assert::report_failure("record allocation failed");
    };
    // SAFETY: freshly allocated record, unpublished and exclusively ours.
    let record = unsafe { record_ptr.as_mut() };
    for slot in 0..ckpt::NUM_CONTEXTS {
        let slot_ctx = record.ctx_mut(slot);
        slot_ctx.map_info.data.set(0x5000_0000, 0, page);
        if slot_ctx.map_info.data.alloc_from_pmem(ctx.pool).is_err() {
            assert::report_failure("data backing allocation failed");
        }
        slot_ctx.map_info.stack.set(0x6000_0000, 0, page);
        if slot_ctx.map_info.stack.alloc_from_pmem(ctx.pool).is_err() {
            assert::report_failure("stack backing allocation failed");
        }
        let mut table = PageTable::new();
        if slot_ctx.map_info.map_all(&mut table, true).is_err() {
            assert::report_failure("segment materialisation failed");
        }
    }
    record.set_valid_ctx_idx(0);

    let mut copied = 0u64;
    let mut flushed = 0u64;
    st_assert!(record.switch_context(&mut copied, &mut flushed).is_ok());
    st_expect_eq!(record.valid_ctx_idx(), Some(1));
    st_assert!(flushed > 0, "commit must issue write-backs");
    st_expect_eq!(copied, 2 * page);
}

fn scheduler_shape(ctx: &mut Context<'_>) {
    st_assert!(ctx.scheduler.num_processes() >= 1, "root process missing");
}
