//! x86_64 context switching implementation
//!
//! System V AMD64: rbx, rbp, r12-r15, rsp plus the MXCSR and x87 control
//! words are preserved across calls, so those are all a switch has to save.

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved state of a suspended context.
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u16, // 0x44
    _pad: u16,
}

/// Initialize a fresh context so that switching to it runs `entry(arg)`
///
/// # Safety
///
/// `stack_top` must be the one-past-the-end address of a writable stack
/// that outlives every switch into this context.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is reached by `jmp`, not `call`, and immediately
    // `call`s the entry: rsp must be 16-byte aligned at that call.
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.rsp = sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.mxcsr = 0x1F80;
    regs.fpucw = 0x037F;
}

/// First code a fresh context executes
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry never returns
        "ud2",
    );
}

/// Save the running context into `old` and resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// `new` must hold a context produced by `init_context` or by a previous
/// `switch_context` whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "jmp rax",
        // Resume point of a context saved above
        "1:",
        "ret",
    );
}
