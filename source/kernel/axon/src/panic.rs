// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unified panic handler emitting deterministic diagnostics
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::last_trap(), uart::raw_writer()
//! INVARIANTS: No allocation; non-locking writer; stable output fields

use core::fmt::Write;
use core::panic::PanicInfo;

use crate::{arch, trap, uart};

/// Emits the panic location and message plus the last recorded trap
/// frame, then parks the CPU.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();

    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    if let Some(message) = info.message().as_str() {
        let _ = w.write_str(message);
    } else {
        let _ = w.write_str("<formatted message>");
    }
    let _ = w.write_str("\n");

    if let Some(frame) = trap::last_trap() {
        let _ = w.write_str("PANIC: last trap:\n");
        let _ = trap::fmt_trap(&frame, &mut w);
    }

    arch::x86_64::halt_loop()
}
