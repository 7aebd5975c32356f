// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trap handling: external ASM entry stubs plus the safe Rust core that
//! saves user state into the working context, drives the scheduler, and
//! reloads the incoming context's state.

use core::fmt::{self, Write};

use spin::Mutex;

use crate::ckpt::{ExecutionContext, GeneralRegisters, InterruptFrame};

// ——— include low-level stubs from assembly (OS target only) ———
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(include_str!("arch/x86_64/trap.S"));

// ——— trap frame ———

/// Register state spilled by the entry stubs. The general-purpose block
/// must match the push order in `arch/x86_64/trap.S` (r15 at the lowest
/// address); the tail is the hardware interrupt frame.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TrapFrame {
    pub gpr: GeneralRegisters,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// ——— diagnostics ———

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
}

pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " rip=0x{:016x} cs=0x{:02x} ss=0x{:02x}", frame.rip, frame.cs, frame.ss)?;
    writeln!(f, " rsp=0x{:016x} rflags=0x{:08x}", frame.rsp, frame.rflags)?;
    writeln!(
        f,
        " rax=0x{:016x} rdi=0x{:016x} rsi=0x{:016x} rdx=0x{:016x}",
        frame.gpr.rax, frame.gpr.rdi, frame.gpr.rsi, frame.gpr.rdx
    )
}

// ——— user-state capture ———

/// Copies the interrupted user state into an execution context. On the
/// OS target this includes the FPU/SSE state.
pub fn save_user_state(frame: &TrapFrame, ctx: &mut ExecutionContext) {
    ctx.cpu.gpr = frame.gpr;
    ctx.cpu.int_frame = InterruptFrame {
        rip: frame.rip,
        cs: frame.cs,
        rflags: frame.rflags,
        rsp: frame.rsp,
        ss: frame.ss,
    };
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::fxsave(&mut ctx.cpu.fpu.data);
}

/// Loads an execution context's saved state back into the frame the stub
/// will return through.
pub fn load_user_state(ctx: &ExecutionContext, frame: &mut TrapFrame) {
    frame.gpr = ctx.cpu.gpr;
    frame.rip = ctx.cpu.int_frame.rip;
    frame.cs = ctx.cpu.int_frame.cs;
    frame.rflags = ctx.cpu.int_frame.rflags;
    frame.rsp = ctx.cpu.int_frame.rsp;
    frame.ss = ctx.cpu.int_frame.ss;
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::fxrstor(&ctx.cpu.fpu.data);
}

// ——— kernel-state registration ———

/// Raw handle to the boot-created kernel state; interrupt entry cannot
/// take arguments, so the boot entry registers the aggregate here once.
struct KernelHandle(
    #[cfg_attr(not(all(target_arch = "x86_64", target_os = "none")), allow(dead_code))]
    core::ptr::NonNull<crate::kmain::KernelState>,
);

// SAFETY: single logical CPU; handlers run with interrupts masked, so the
// pointer is never dereferenced concurrently.
unsafe impl Send for KernelHandle {}

static KERNEL_STATE: Mutex<Option<KernelHandle>> = Mutex::new(None);

/// Publishes the kernel aggregate for the interrupt path.
///
/// # Safety
///
/// `state` must stay valid for the rest of the kernel's lifetime.
pub(crate) unsafe fn install_kernel_state(state: core::ptr::NonNull<crate::kmain::KernelState>) {
    *KERNEL_STATE.lock() = Some(KernelHandle(state));
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn with_kernel<R>(f: impl FnOnce(&mut crate::kmain::KernelState) -> R) -> Option<R> {
    let guard = KERNEL_STATE.lock();
    let handle = guard.as_ref()?;
    // SAFETY: see `KernelHandle`; the handler owns the CPU exclusively.
    let state = unsafe { &mut *handle.0.as_ptr() };
    Some(f(state))
}

// ——— Rust trap handlers called from assembly ———

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[no_mangle]
extern "C" fn __timer_trap_rust(frame: &mut TrapFrame) {
    record(frame);
    with_kernel(|kernel| kernel.preempt(frame));
    crate::arch::x86_64::end_of_interrupt();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[no_mangle]
extern "C" fn __syscall_trap_rust(frame: &mut TrapFrame) {
    record(frame);
    with_kernel(|kernel| kernel.syscall(frame));
}

// ——— vector installation ———

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    fn __timer_vector();
    fn __syscall_vector();
}

/// Builds and loads the IDT: the timer tick and the user syscall gate.
/// Exceptions fall through to the boot environment's handlers.
///
/// # Safety
///
/// Must run once on the boot CPU before interrupts are enabled.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn install_trap_vectors() {
    use x86_64::structures::idt::InterruptDescriptorTable;
    use x86_64::{PrivilegeLevel, VirtAddr};

    use crate::config::{SYSCALL_VECTOR, TIMER_VECTOR};

    static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: both stubs end in iretq and preserve all registers.
        unsafe {
            idt[TIMER_VECTOR].set_handler_addr(VirtAddr::new(__timer_vector as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(__syscall_vector as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    });
    idt.load();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[allow(dead_code)]
pub unsafe fn install_trap_vectors() {}

// ——— tests (host) ———

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::string::String;

    use super::*;

    #[test]
    fn record_and_query_last_trap() {
        let mut frame = TrapFrame::default();
        frame.rip = 0x1000;
        record(&frame);
        let recorded = last_trap().expect("trap stored");
        assert_eq!(recorded.rip, 0x1000);
    }

    #[test]
    fn fmt_includes_key_registers() {
        let mut frame = TrapFrame::default();
        frame.rip = 0x2000;
        frame.gpr.rax = 7;
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("rip"));
        assert!(out.contains("rax"));
        assert!(out.contains("rflags"));
    }

    #[test]
    fn save_and_load_round_trip_preserves_state() {
        let mut ctx = ExecutionContext::zeroed();
        let mut frame = TrapFrame::default();
        frame.rip = 0x40_1234;
        frame.rsp = 0x60_0ff0;
        frame.rflags = 0x202;
        frame.gpr.rbx = 0xdead;
        save_user_state(&frame, &mut ctx);

        let mut reloaded = TrapFrame::default();
        load_user_state(&ctx, &mut reloaded);
        assert_eq!(reloaded.rip, 0x40_1234);
        assert_eq!(reloaded.rsp, 0x60_0ff0);
        assert_eq!(reloaded.rflags, 0x202);
        assert_eq!(reloaded.gpr.rbx, 0xdead);
    }
}
