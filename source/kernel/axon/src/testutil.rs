// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for host-side tests: a page-aligned arena standing in
//! for the persistent region, with snapshot/restore for crash replay.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::mm::PAGE_SIZE;
use crate::pmem::PmemPool;

/// Page-aligned byte arena used as fake persistent memory. Its addresses
/// satisfy the kernel's identity-window convention, so pool physical
/// addresses are directly dereferenceable.
pub struct TestArena {
    _backing: Vec<u8>,
    base: usize,
    len: usize,
}

impl TestArena {
    pub fn new(pages: usize) -> Self {
        let len = pages * PAGE_SIZE;
        let mut backing = vec![0u8; len + PAGE_SIZE];
        let raw = backing.as_mut_ptr() as usize;
        let base = (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Self { _backing: backing, base, len }
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }

    /// Formats a fresh pool over the whole arena.
    pub fn pool(&mut self) -> PmemPool {
        // SAFETY: the arena owns the range for its whole lifetime.
        unsafe { PmemPool::format(self.base(), self.len()).expect("format pool") }
    }

    /// Copies out the current durable image.
    pub fn snapshot(&self) -> Vec<u8> {
        // SAFETY: the arena owns [base, base + len).
        unsafe { core::slice::from_raw_parts(self.base as *const u8, self.len).to_vec() }
    }

    /// Rewinds the arena to a previously taken snapshot.
    pub fn restore(&mut self, snapshot: &[u8]) {
        assert_eq!(snapshot.len(), self.len);
        // SAFETY: the arena owns [base, base + len).
        unsafe {
            core::ptr::copy_nonoverlapping(snapshot.as_ptr(), self.base as *mut u8, self.len);
        }
    }
}
