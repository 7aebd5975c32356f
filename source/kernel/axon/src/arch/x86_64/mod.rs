// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! x86-64 privileged-instruction shims used by the portable kernel core.
//!
//! Everything that touches real hardware is gated on
//! `target_os = "none"`; host builds (unit tests) get inert fallbacks so
//! the portable logic above this layer stays exercisable.

/// RFLAGS bit 1 is fixed to one by the architecture.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// RFLAGS interrupt-enable bit; set for user contexts so the timer can
/// preempt them.
pub const RFLAGS_INTERRUPT_ENABLE: u64 = 1 << 9;

/// Selectors of the boot GDT (kernel code/data at 1 and 2, user data/code
/// at 3 and 4 with RPL 3). The GDT itself is installed by the boot
/// environment.
pub const KERNEL_CS: u16 = 0x08;
#[allow(dead_code)]
pub const KERNEL_SS: u16 = 0x10;
pub const USER_SS: u16 = 0x1b;
pub const USER_CS: u16 = 0x23;

/// Writes back the cache line containing `addr` to memory. This is the
/// kernel's only durability primitive.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn clflush(addr: *const u8) {
    // SAFETY: clflush does not access memory contents and cannot fault on
    // a canonical address; it only pushes the line out of the hierarchy.
    unsafe {
        core::arch::asm!("clflush [{0}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Installs `paddr` as the root page table.
///
/// # Safety
///
/// `paddr` must reference a live, well-formed PML4 that maps the
/// currently executing code and stack.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub unsafe fn write_cr3(paddr: u64) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) paddr, options(nostack, preserves_flags));
    }
}

/// Reads the active root page table address.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
#[allow(dead_code)]
pub fn read_cr3() -> u64 {
    let value: u64;
    // SAFETY: reading CR3 has no side effects in ring 0.
    unsafe {
        core::arch::asm!("mov {0}, cr3", out(reg) value, options(nostack, preserves_flags));
    }
    value
}

/// Saves the FPU/SSE state into a 512-byte FXSAVE area.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn fxsave(area: &mut [u8; 512]) {
    // SAFETY: the area is 16-byte aligned by its containing type.
    unsafe {
        core::arch::asm!("fxsave64 [{0}]", in(reg) area.as_mut_ptr(), options(nostack));
    }
}

/// Restores the FPU/SSE state from a 512-byte FXSAVE area.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn fxrstor(area: &[u8; 512]) {
    // SAFETY: the area is 16-byte aligned and was produced by fxsave.
    unsafe {
        core::arch::asm!("fxrstor64 [{0}]", in(reg) area.as_ptr(), options(nostack));
    }
}

/// Signals end-of-interrupt to the legacy PIC after a timer tick.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn end_of_interrupt() {
    use x86_64::instructions::port::Port;
    let mut cmd: Port<u8> = Port::new(0x20);
    // SAFETY: PIC command port write; no memory side effects.
    unsafe { cmd.write(0x20) };
}

/// Runs `f` with maskable interrupts disabled. The single-CPU critical
/// sections of the scheduler and allocator rely on this.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        f()
    }
}

/// Parks the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::hlt();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Final resting place after a fatal error.
#[allow(dead_code)]
pub fn halt_loop() -> ! {
    loop {
        wait_for_interrupt();
    }
}
