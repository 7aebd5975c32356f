// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs
//! DEPENDS_ON: sched::Scheduler, task::ProcessTable, ckpt, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; errors are encoded
//!             as values in the top of the return range (never unwinding)

pub mod api;

use core::fmt;

use crate::ckpt::{CkptError, HeapError};
use crate::sched::SchedError;

/// Number of syscall slots in this increment.
const MAX_SYSCALL: usize = 8;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers rdi, rsi, rdx, r10, r8, r9.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [u64; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [u64; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> u64 {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_YIELD: u64 = 0;
/// Terminates the calling process with an exit code.
pub const SYSCALL_EXIT: u64 = 1;
/// Adjusts the persistent user heap by a signed delta and returns the new
/// heap end.
pub const SYSCALL_BRK: u64 = 2;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Heap watermark adjustment violated its bounds.
    Heap(HeapError),
    /// Scheduler ring is saturated.
    Sched(SchedError),
    /// Checkpoint engine refused the operation.
    Ckpt(CkptError),
    /// The calling process has no persistent heap to adjust.
    NoHeap,
}

impl From<HeapError> for Error {
    fn from(value: HeapError) -> Self {
        Self::Heap(value)
    }
}

impl From<SchedError> for Error {
    fn from(value: SchedError) -> Self {
        Self::Sched(value)
    }
}

impl From<CkptError> for Error {
    fn from(value: CkptError) -> Self {
        Self::Ckpt(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encodes an error as a negative return value for user space.
pub fn encode_error(err: Error) -> u64 {
    match err {
        Error::InvalidSyscall => u64::MAX,
        Error::Heap(HeapError::Overflow) => u64::MAX - 1,
        Error::Heap(HeapError::Underflow) => u64::MAX - 2,
        Error::Sched(_) => u64::MAX - 3,
        Error::Ckpt(_) => u64::MAX - 4,
        Error::NoHeap => u64::MAX - 5,
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<u64>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: u64, handler: Handler) {
        if let Some(slot) = self.handlers.get_mut(number as usize) {
            *slot = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: u64,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<u64> {
        self.handlers
            .get(number as usize)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_numbers_are_rejected() {
        let table = SyscallTable::new();
        let mut procs = crate::task::ProcessTable::new();
        let mut sched = crate::sched::Scheduler::new(&mut procs);
        let mut arena = crate::testutil::TestArena::new(8);
        let mut pool = arena.pool();
        let mut ctx = api::Context::new(&mut sched, &mut procs, &mut pool);
        assert_eq!(
            table.dispatch(99, &mut ctx, &Args::default()),
            Err(Error::InvalidSyscall)
        );
    }

    #[test]
    fn error_encoding_is_stable_and_distinct() {
        let encodings = [
            encode_error(Error::InvalidSyscall),
            encode_error(Error::Heap(HeapError::Overflow)),
            encode_error(Error::Heap(HeapError::Underflow)),
            encode_error(Error::Sched(SchedError::Full)),
            encode_error(Error::NoHeap),
        ];
        for (i, a) in encodings.iter().enumerate() {
            assert!(*a > i64::MAX as u64, "errors look negative to user space");
            for b in encodings.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
