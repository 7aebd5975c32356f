// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal serial (COM1) support for boot diagnostics.

use core::fmt::{self, Write};
use spin::Mutex;

/// I/O port base of the first serial adapter.
const COM1_BASE: u16 = 0x3f8;
#[allow(dead_code)]
const REG_THR: u16 = 0;
#[allow(dead_code)]
const REG_LSR: u16 = 5;
#[allow(dead_code)]
const LSR_THR_EMPTY: u8 = 1 << 5;

/// Global serial writer used for boot logs.
static COM1: Mutex<KernelUart> = Mutex::new(KernelUart::new(COM1_BASE));

/// Serial writer capable of formatted output.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: u16,
}

impl KernelUart {
    /// Creates a serial writer rooted at `base`.
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Returns a guard for the boot serial singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        COM1.lock()
    }

    fn write_byte(&self, byte: u8) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            use x86_64::instructions::port::Port;
            let mut lsr: Port<u8> = Port::new(self.base + REG_LSR);
            let mut thr: Port<u8> = Port::new(self.base + REG_THR);
            // SAFETY: COM1 registers; reads/writes have no memory side effects.
            unsafe {
                while lsr.read() & LSR_THR_EMPTY == 0 {}
                thr.write(byte);
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = byte;
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Non-locking writer for panic paths where the lock may already be held.
pub fn raw_writer() -> KernelUart {
    KernelUart::new(COM1_BASE)
}

/// Writes the provided string via the global serial port.
#[allow(dead_code)]
pub fn write_str(message: &str) {
    let mut uart = KernelUart::lock();
    let _ = uart.write_str(message);
}

/// Writes a line terminated by `\n` to the serial port.
pub fn write_line(message: &str) {
    let mut uart = KernelUart::lock();
    let _ = writeln!(uart, "{message}");
}
