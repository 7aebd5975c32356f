// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Compile-time configuration knobs for the AXON kernel.

/// Fallback physical base of the persistent pool when the boot loader does
/// not hand one over. Matches the QEMU `nvdimm` default layout we test on.
pub const DEFAULT_POOL_BASE: u64 = 0x1_8000_0000;

/// Fallback size of the persistent pool.
pub const DEFAULT_POOL_SIZE: u64 = 64 * 1024 * 1024;

/// Size of the per-process kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Default virtual bases of the four user segments. A process image may
/// override these; the defaults keep the ranges trivially disjoint.
pub const USER_CODE_BASE: u64 = 0x4000_0000;
pub const USER_DATA_BASE: u64 = 0x5000_0000;
pub const USER_STACK_BASE: u64 = 0x6000_0000;
pub const USER_HEAP_BASE: u64 = 0x7000_0000;

/// IDT vector driven by the platform timer.
pub const TIMER_VECTOR: u8 = 32;

/// Software-interrupt vector used for the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;
