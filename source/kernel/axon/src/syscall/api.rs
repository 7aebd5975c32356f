// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: sched::Scheduler, task::ProcessTable, pmem::PmemPool
//! INVARIANTS: Handlers never unwind; heap errors surface to the caller
//!             as negative returns; exit and yield reschedule through the
//!             scheduler only

use crate::pmem::PmemPool;
use crate::sched::Scheduler;
use crate::task::ProcessTable;

use super::{Args, Error, SysResult, SyscallTable, SYSCALL_BRK, SYSCALL_EXIT, SYSCALL_YIELD};

/// Borrowed kernel subsystems threaded into every handler; built by the
/// boot entry, never a global.
pub struct Context<'a> {
    pub scheduler: &'a mut Scheduler,
    pub procs: &'a mut ProcessTable,
    #[allow(dead_code)]
    pub pool: &'a mut PmemPool,
}

impl<'a> Context<'a> {
    pub fn new(
        scheduler: &'a mut Scheduler,
        procs: &'a mut ProcessTable,
        pool: &'a mut PmemPool,
    ) -> Self {
        Self { scheduler, procs, pool }
    }
}

/// Registers every handler of this increment.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_BRK, sys_brk);
}

/// Cooperatively hands the CPU to the next ready process.
fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<u64> {
    ctx.scheduler.switch_process(ctx.procs);
    Ok(0)
}

/// Terminates the calling process; the scheduler immediately moves on.
fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<u64> {
    let code = args.get(0);
    ctx.scheduler.kill_current(ctx.procs, code);
    Ok(0)
}

/// Adjusts the persistent heap watermark of the calling process by a
/// signed delta and returns the new heap end virtual address.
fn sys_brk(ctx: &mut Context<'_>, args: &Args) -> SysResult<u64> {
    let delta = args.get(0) as i64;
    let current = ctx.procs.current_mut();
    let record = current.persistent_mut().ok_or(Error::NoHeap)?;
    let working = record.working_ctx_mut()?;
    let end = working.expand_heap(delta)?;
    Ok(end)
}
