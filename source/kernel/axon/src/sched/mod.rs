// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Round-robin scheduler. Checkpoints persistent processes at every
//! context switch, before their address space is left.

use crate::arch::x86_64 as arch;
use crate::log_error;
use crate::task::{Pid, ProcessTable, Status};

#[cfg(test)]
mod tests_prop;

/// Capacity of the scheduler ring.
pub const MAX_PROCESSES: usize = 256;

/// Errors reported by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// The ring already holds `MAX_PROCESSES` processes.
    Full,
}

/// Fixed-capacity ring of non-owning process references. Ties between
/// ready processes are broken by insertion order.
pub struct Scheduler {
    ring: [Option<Pid>; MAX_PROCESSES],
    len: usize,
    /// Ring index of the process currently holding the CPU.
    cursor: usize,
}

impl Scheduler {
    /// Creates a scheduler seeded with the table's root process; the
    /// current process pointer is never invalid from here on.
    pub fn new(procs: &mut ProcessTable) -> Self {
        let root = procs.current_pid();
        let mut ring = [None; MAX_PROCESSES];
        ring[0] = Some(root);
        if let Some(process) = procs.process_mut(root) {
            process.set_status(Status::Running);
        }
        Self { ring, len: 1, cursor: 0 }
    }

    /// Number of registered processes, the root included.
    pub fn num_processes(&self) -> usize {
        self.len
    }

    /// Appends `pid` to the ring and marks it ready to run.
    pub fn register_process(
        &mut self,
        pid: Pid,
        procs: &mut ProcessTable,
    ) -> Result<(), SchedError> {
        arch::without_interrupts(|| {
            if self.len == MAX_PROCESSES {
                return Err(SchedError::Full);
            }
            self.ring[self.len] = Some(pid);
            self.len += 1;
            if let Some(process) = procs.process_mut(pid) {
                // A killed process never becomes ready again.
                if process.status() != Status::Killed {
                    process.set_status(Status::Ready);
                }
            }
            Ok(())
        })
    }

    /// Hands the CPU to the next ready process in ring order. A
    /// persistent outgoing process is checkpointed before its address
    /// space is abandoned; the incoming context's root table is installed
    /// afterwards. Returns the incoming PID (the current one when nothing
    /// else is runnable).
    pub fn switch_process(&mut self, procs: &mut ProcessTable) -> Pid {
        arch::without_interrupts(|| {
            let outgoing = procs.current_pid();

            let mut found = None;
            for step in 1..=self.len {
                let index = (self.cursor + step) % self.len;
                let Some(pid) = self.ring[index] else { continue };
                match procs.process(pid).map(|process| process.status()) {
                    Some(Status::Ready) | Some(Status::Running) => {
                        found = Some((index, pid));
                        break;
                    }
                    _ => {}
                }
            }
            let Some((index, incoming)) = found else {
                return outgoing;
            };
            if incoming == outgoing {
                return outgoing;
            }

            let mut outgoing_schedulable = false;
            if let Some(process) = procs.process_mut(outgoing) {
                if process.status() == Status::Running {
                    process.set_status(Status::Ready);
                }
                outgoing_schedulable =
                    matches!(process.status(), Status::Ready | Status::Sleeping);
            }

            // Commit the outgoing process's interval while its segments are
            // still the active address space. Killed processes keep their
            // last committed snapshot instead.
            if outgoing_schedulable {
                if let Some(process) = procs.process_mut(outgoing) {
                    let mut copied = 0u64;
                    let mut flushed = 0u64;
                    if let Some(record) = process.persistent_mut() {
                        match record.switch_context(&mut copied, &mut flushed) {
                            Ok(()) => {
                                crate::log_debug!(
                                    target: "sched",
                                    "checkpoint pid={} copied={}B flushes={}",
                                    outgoing.raw(),
                                    copied,
                                    flushed
                                );
                            }
                            Err(err) => {
                                log_error!(
                                    target: "sched",
                                    "checkpoint failed for pid={}: {:?}",
                                    outgoing.raw(),
                                    err
                                );
                            }
                        }
                    }
                    process.note_checkpoint(copied, flushed);
                }
            }

            self.cursor = index;
            procs.set_current(incoming);
            if let Some(process) = procs.process_mut(incoming) {
                process.set_status(Status::Running);
                process.note_ctx_switch();
            }

            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            if let Some(process) = procs.process(incoming) {
                if let Some(record) = process.persistent() {
                    if let Ok(ctx) = record.working_ctx() {
                        // SAFETY: the working context's CR3 names a live
                        // root table built when the process was created or
                        // recovered.
                        unsafe { arch::write_cr3(ctx.cpu.cr3) };
                    }
                }
            }

            incoming
        })
    }

    /// Marks the current process killed, removes it from the ring and
    /// immediately yields. Its persistent segments stay allocated; only
    /// the runtime handle dies.
    pub fn kill_current(&mut self, procs: &mut ProcessTable, exit_code: u64) -> Pid {
        arch::without_interrupts(|| {
            let victim = procs.current_pid();
            if victim == Pid::ROOT {
                log_error!(target: "sched", "refusing to kill the root process");
                return victim;
            }
            if let Some(process) = procs.process_mut(victim) {
                process.set_status(Status::Killed);
                process.set_exit_code(exit_code);
            }
            if let Some(position) = (0..self.len).find(|&i| self.ring[i] == Some(victim)) {
                for i in position..self.len - 1 {
                    self.ring[i] = self.ring[i + 1];
                }
                self.ring[self.len - 1] = None;
                self.len -= 1;
                if self.cursor >= position && self.cursor > 0 {
                    self.cursor -= 1;
                }
                if self.len > 0 {
                    self.cursor %= self.len;
                }
            }
            self.switch_process(procs)
        })
    }

    /// Registers `pid` and cooperatively yields until it exits, returning
    /// its exit code.
    pub fn launch_and_wait_until_exit(
        &mut self,
        procs: &mut ProcessTable,
        pid: Pid,
    ) -> Result<u64, SchedError> {
        self.register_process(pid, procs)?;
        loop {
            match procs.process(pid).map(|process| (process.status(), process.exit_code())) {
                Some((Status::Killed, code)) => return Ok(code),
                None => return Ok(0),
                _ => {}
            }
            self.switch_process(procs);
            arch::wait_for_interrupt();
        }
    }
}
