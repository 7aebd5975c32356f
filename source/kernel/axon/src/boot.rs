// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Early boot routines for the AXON kernel.

use crate::kmain;

/// Hand-over from the boot loader.
#[derive(Clone, Copy, Debug)]
pub struct BootInfo {
    /// Physical base of the persistent region; zero when the loader found
    /// none.
    pub pmem_base: u64,
    /// Size of the persistent region in bytes.
    pub pmem_size: u64,
}

#[cfg(all(target_arch = "x86_64", target_os = "none", not(test)))]
extern "C" {
    static mut __bss_start: u8;
    static mut __bss_end: u8;
}

/// Kernel entry invoked by the binary stub. The boot loader passes the
/// persistent pool's base and size in the first two argument registers;
/// zeroes mean "no pool found" and the kernel falls back to the
/// configured default region.
pub fn start(pmem_base: u64, pmem_size: u64) -> ! {
    // SAFETY: runs exactly once on the boot CPU with interrupts masked.
    unsafe {
        zero_bss();
        crate::trap::install_trap_vectors();
    }
    kmain::kmain(BootInfo { pmem_base, pmem_size })
}

unsafe fn zero_bss() {
    #[cfg(all(target_arch = "x86_64", target_os = "none", not(test)))]
    // SAFETY: the linker script guarantees the range is writable and not
    // yet in use; nothing references .bss before this runs.
    unsafe {
        let start = core::ptr::addr_of_mut!(__bss_start);
        let end = core::ptr::addr_of_mut!(__bss_end);
        let len = end as usize - start as usize;
        core::ptr::write_bytes(start, 0, len);
    }
}
