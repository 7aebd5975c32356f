// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! AXON kernel library – no binary entry here.
//!
//! A persistent-memory process-checkpointing kernel for x86-64: process
//! state and address-space mappings live in persistent RAM, committed
//! through a two-slot double buffer, and survive power loss.

#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

// Global allocator (volatile kernel heap; OS target only, host builds
// use the platform allocator).

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const HEAP_SIZE: usize = 1024 * 1024;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[link_section = ".bss.heap"]
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOC: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub(crate) fn init_heap() {
    // SAFETY: single-threaded early boot; we only pass a raw pointer and
    // length once.
    unsafe {
        let start: *mut u8 = core::ptr::addr_of_mut!(HEAP) as *mut u8;
        ALLOC.lock().init(start, HEAP_SIZE);
    }
}

// Modules

pub mod arch;
pub mod boot;
pub mod ckpt;
pub mod config;
pub mod kmain;
pub mod log;
pub mod mm;
pub mod pmem;
pub mod recovery;
pub mod sched;
pub mod selftest;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod uart;

// The kernel panic handler only exists on the OS target.
#[cfg(all(not(test), target_arch = "x86_64", target_os = "none"))]
mod panic;

#[cfg(test)]
mod testutil;

// Tests

#[cfg(test)]
mod tests {
    use static_assertions::const_assert_eq;

    use crate::ckpt::{CpuContext, FpuContext};
    use crate::trap::TrapFrame;

    #[test]
    fn durable_record_layout() {
        const_assert_eq!(core::mem::size_of::<FpuContext>(), 512);
        const_assert_eq!(core::mem::align_of::<CpuContext>(), 16);
        // 15 general-purpose registers plus the five-word hardware frame.
        const_assert_eq!(core::mem::size_of::<TrapFrame>(), 20 * 8);
    }
}
