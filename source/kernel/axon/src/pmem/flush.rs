// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cache-line write-back primitives and the typed durable-store helper.
//!
//! Every durable mutation in the kernel funnels through this module so
//! that a store is never left sitting in the cache hierarchy without a
//! matching write-back. Host builds route the write-backs into a journal
//! that the crash-consistency tests replay, one durable operation at a
//! time.

/// Cache-line granularity of the write-back instruction.
pub const CACHE_LINE_SIZE: usize = 64;

/// Writes back the cache line containing `addr`.
#[inline]
pub fn clflush(addr: *const u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::clflush(addr);
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    journal::record(addr as usize);
}

/// Writes back every cache line covering `len` bytes at `addr` and adds
/// the number of lines flushed to `flush_count`.
pub fn persist(addr: *const u8, len: usize, flush_count: &mut u64) {
    if len == 0 {
        return;
    }
    let start = addr as usize & !(CACHE_LINE_SIZE - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        clflush(line as *const u8);
        *flush_count += 1;
        line += CACHE_LINE_SIZE;
    }
}

/// Durable store: a volatile write immediately paired with a write-back
/// of the covering cache lines. This is the only way the kernel mutates
/// single fields of durable records.
pub fn store<T: Copy>(slot: &mut T, value: T) {
    // SAFETY: `slot` is a valid exclusive reference; volatile keeps the
    // store ordered with respect to the write-back below.
    unsafe { core::ptr::write_volatile(slot, value) };
    let mut ignored = 0u64;
    persist(slot as *const T as *const u8, core::mem::size_of::<T>(), &mut ignored);
}

/// Host-side write-back journal.
///
/// Bare-metal builds never compile this; on the host every `clflush`
/// lands here instead. A test may capture the journal for an address
/// range and later replay a prefix of it onto a baseline image, which
/// reconstructs exactly the durable state a power loss at that point
/// would have left behind.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub mod journal {
    extern crate alloc;

    use alloc::vec::Vec;
    use spin::Mutex;

    use super::CACHE_LINE_SIZE;

    /// One durable operation: the line address and the bytes that became
    /// durable when it was written back.
    #[derive(Clone)]
    pub struct FlushOp {
        pub addr: usize,
        pub line: [u8; CACHE_LINE_SIZE],
    }

    struct Capture {
        base: usize,
        len: usize,
        ops: Vec<FlushOp>,
    }

    static CAPTURE: Mutex<Option<Capture>> = Mutex::new(None);
    static EXCLUSIVE: Mutex<()> = Mutex::new(());

    /// Serialises tests that use the (global) capture buffer.
    pub fn exclusive() -> spin::MutexGuard<'static, ()> {
        EXCLUSIVE.lock()
    }

    pub(super) fn record(addr: usize) {
        let line = addr & !(CACHE_LINE_SIZE - 1);
        let mut guard = CAPTURE.lock();
        let Some(capture) = guard.as_mut() else {
            return;
        };
        if line < capture.base || line + CACHE_LINE_SIZE > capture.base + capture.len {
            return;
        }
        let mut bytes = [0u8; CACHE_LINE_SIZE];
        // SAFETY: the captured range is a live allocation owned by the
        // test harness for the duration of the capture.
        unsafe {
            core::ptr::copy_nonoverlapping(line as *const u8, bytes.as_mut_ptr(), CACHE_LINE_SIZE);
        }
        capture.ops.push(FlushOp { addr: line, line: bytes });
    }

    /// Starts recording write-backs that hit `[base, base + len)`.
    pub fn begin_capture(base: usize, len: usize) {
        *CAPTURE.lock() = Some(Capture { base, len, ops: Vec::new() });
    }

    /// Stops recording and returns the captured operations in order.
    pub fn end_capture() -> Vec<FlushOp> {
        CAPTURE.lock().take().map(|capture| capture.ops).unwrap_or_default()
    }

    /// Applies the first `k` captured write-backs in place. Combined with
    /// restoring the target range to its pre-capture baseline first, this
    /// reconstructs the durable image of a crash after operation `k`.
    pub fn replay_prefix(ops: &[FlushOp], k: usize) {
        for op in &ops[..k] {
            // SAFETY: `addr` was validated against the captured range when
            // the operation was recorded.
            unsafe {
                core::ptr::copy_nonoverlapping(op.line.as_ptr(), op.addr as *mut u8, CACHE_LINE_SIZE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_counts_every_line() {
        let buffer = [0u8; 256];
        let mut count = 0;
        persist(buffer.as_ptr(), 256, &mut count);
        // 256 bytes may straddle one extra line depending on alignment.
        assert!(count == 4 || count == 5);
    }

    #[test]
    fn persist_of_empty_range_is_noop() {
        let buffer = [0u8; 8];
        let mut count = 0;
        persist(buffer.as_ptr(), 0, &mut count);
        assert_eq!(count, 0);
    }

    #[repr(align(64))]
    struct Aligned([u8; CACHE_LINE_SIZE * 2]);

    #[test]
    fn journal_captures_only_the_requested_range() {
        let _gate = journal::exclusive();
        let inside = Aligned([0xab; CACHE_LINE_SIZE * 2]);
        let outside = Aligned([0xcd; CACHE_LINE_SIZE * 2]);
        journal::begin_capture(inside.0.as_ptr() as usize, inside.0.len());
        let mut count = 0;
        persist(inside.0.as_ptr(), CACHE_LINE_SIZE, &mut count);
        persist(outside.0.as_ptr(), CACHE_LINE_SIZE, &mut count);
        let ops = journal::end_capture();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].addr, inside.0.as_ptr() as usize);
        assert_eq!(ops[0].line, [0xab; CACHE_LINE_SIZE]);
    }
}
