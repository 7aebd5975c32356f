// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Standalone AXON kernel binary: the boot loader jumps here with the
//! persistent region's base and size in the first two argument registers.

#![cfg_attr(all(not(test), target_os = "none"), no_std)]
#![cfg_attr(all(not(test), target_os = "none"), no_main)]

/// Entry point handed to the boot loader.
#[cfg(all(not(test), target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start(pmem_base: u64, pmem_size: u64) -> ! {
    axon::boot::start(pmem_base, pmem_size)
}

/// Host builds produce an inert binary; the kernel only runs on bare
/// metal.
#[cfg(any(test, not(target_os = "none")))]
fn main() {}
