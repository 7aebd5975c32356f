// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel main routine: subsystem bring-up, cold-start recovery, and the
//! root idle loop.

extern crate alloc;

use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::arch::x86_64 as arch;
use crate::boot::BootInfo;
use crate::config::{DEFAULT_POOL_BASE, DEFAULT_POOL_SIZE};
use crate::pmem::PmemPool;
use crate::recovery;
use crate::sched::Scheduler;
use crate::syscall::{self, api, SyscallTable};
use crate::task::ProcessTable;
use crate::trap::{self, TrapFrame};
use crate::uart;
use crate::{log_info, log_warn};

/// Aggregated kernel state built once by the boot entry and threaded into
/// every subsystem; there is no global singleton besides the raw handle
/// the trap layer keeps for interrupt entry.
pub(crate) struct KernelState {
    pool: PmemPool,
    procs: ProcessTable,
    scheduler: Scheduler,
    syscalls: SyscallTable,
}

impl KernelState {
    fn new(boot: &BootInfo) -> Self {
        let (base, size) = if boot.pmem_base != 0 && boot.pmem_size != 0 {
            (boot.pmem_base, boot.pmem_size)
        } else {
            log_warn!(target: "kmain", "boot loader handed over no pool; using default region");
            (DEFAULT_POOL_BASE, DEFAULT_POOL_SIZE)
        };
        // SAFETY: the region comes from the boot contract (or the platform
        // default) and is reachable through the identity window.
        let (mut pool, durable) = match unsafe { PmemPool::open(base, size) } {
            Ok(result) => result,
            Err(err) => panic!("persistent pool unusable: {:?}", err),
        };
        log_info!(
            target: "kmain",
            "pool at 0x{:x}: durable={} free_pages={}",
            base,
            durable,
            pool.remaining_pages()
        );

        let mut procs = ProcessTable::new();
        #[cfg(feature = "debug_uart")]
        uart::write_line("KS: after ProcessTable::new");
        let mut scheduler = Scheduler::new(&mut procs);
        #[cfg(feature = "debug_uart")]
        uart::write_line("KS: after Scheduler::new");
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        #[cfg(feature = "debug_uart")]
        uart::write_line("KS: after install_handlers");

        // Scheduler saturation during recovery is fatal at registration
        // time; everything else is handled inside the walk.
        if let Err(err) = recovery::restore_processes(&mut pool, &mut procs, &mut scheduler) {
            panic!("recovery aborted: {:?}", err);
        }

        Self { pool, procs, scheduler, syscalls }
    }

    fn banner(&self) {
        uart::write_line("");
        uart::write_line("  __ _ __  _____  _ __");
        uart::write_line(" / _` |\\ \\/ / _ \\| '_ \\");
        uart::write_line("| (_| | >  < (_) | | | |");
        uart::write_line(" \\__,_|/_/\\_\\___/|_| |_|");
        uart::write_line("");
        uart::write_line("axon vers. 0.1.0 - checkpoints that outlive the power cord");
    }

    /// Timer preemption path: capture the interrupted user state into the
    /// working slot, let the scheduler (and checkpoint engine) run, then
    /// return through whichever context is current now.
    #[cfg_attr(not(all(target_arch = "x86_64", target_os = "none")), allow(dead_code))]
    pub(crate) fn preempt(&mut self, frame: &mut TrapFrame) {
        if let Some(record) = self.procs.current_mut().persistent_mut() {
            if let Ok(working) = record.working_ctx_mut() {
                trap::save_user_state(frame, working);
            }
        }
        self.scheduler.switch_process(&mut self.procs);
        if let Some(record) = self.procs.current_mut().persistent_mut() {
            if let Ok(working) = record.working_ctx_mut() {
                trap::load_user_state(working, frame);
            }
        }
    }

    /// Syscall path from ring 3. The caller's result lands in its saved
    /// rax; when the call rescheduled, the frame returns through the new
    /// current context instead.
    #[cfg_attr(not(all(target_arch = "x86_64", target_os = "none")), allow(dead_code))]
    pub(crate) fn syscall(&mut self, frame: &mut TrapFrame) {
        let caller = self.procs.current_pid();
        if let Some(record) = self.procs.current_mut().persistent_mut() {
            if let Ok(working) = record.working_ctx_mut() {
                trap::save_user_state(frame, working);
            }
        }

        let number = frame.gpr.rax;
        let args = syscall::Args::new([
            frame.gpr.rdi,
            frame.gpr.rsi,
            frame.gpr.rdx,
            frame.gpr.r10,
            frame.gpr.r8,
            frame.gpr.r9,
        ]);
        let result = {
            let mut ctx = api::Context::new(&mut self.scheduler, &mut self.procs, &mut self.pool);
            self.syscalls.dispatch(number, &mut ctx, &args)
        };
        let encoded = match result {
            Ok(value) => value,
            Err(err) => syscall::encode_error(err),
        };

        if let Some(process) = self.procs.process_mut(caller) {
            if let Some(record) = process.persistent_mut() {
                if let Ok(working) = record.working_ctx_mut() {
                    working.cpu.gpr.rax = encoded;
                }
            }
        }

        if self.procs.current_pid() != caller {
            if let Some(record) = self.procs.current_mut().persistent_mut() {
                if let Ok(working) = record.working_ctx_mut() {
                    trap::load_user_state(working, frame);
                }
            }
        } else {
            frame.gpr.rax = encoded;
        }
    }

    fn idle_loop(&mut self) -> ! {
        loop {
            let yielded = {
                let mut ctx =
                    api::Context::new(&mut self.scheduler, &mut self.procs, &mut self.pool);
                self.syscalls
                    .dispatch(syscall::SYSCALL_YIELD, &mut ctx, &syscall::Args::default())
            };
            let _ = yielded;
            arch::wait_for_interrupt();
        }
    }
}

/// Kernel main invoked after early boot completed.
pub fn kmain(boot: BootInfo) -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::init_heap();
    uart::write_line("AXON: entering kmain");

    let kernel = Box::leak(Box::new(KernelState::new(&boot)));
    // SAFETY: the kernel state was just leaked and lives forever.
    unsafe { trap::install_kernel_state(NonNull::from(&mut *kernel)) };

    kernel.banner();

    #[cfg(feature = "selftest")]
    {
        let mut ctx = crate::selftest::Context {
            pool: &mut kernel.pool,
            procs: &mut kernel.procs,
            scheduler: &mut kernel.scheduler,
        };
        crate::selftest::entry(&mut ctx);
    }

    kernel.idle_loop()
}
