//! aarch64 context switching implementation
//!
//! AAPCS64: x19-x28, fp (x29), lr (x30), sp and the low halves of v8-v15
//! are callee-saved.

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved state of a suspended context.
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub sp: u64,       // 0x00
    pub pc: u64,       // 0x08
    pub x19_x28: [u64; 10], // 0x10..0x60
    pub fp: u64,       // 0x60
    pub lr: u64,       // 0x68
    pub d8_d15: [u64; 8], // 0x70..0xb0
}

/// Initialize a fresh context so that switching to it runs `entry(arg)`
///
/// # Safety
///
/// `stack_top` must be the one-past-the-end address of a writable stack
/// that outlives every switch into this context.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.sp = sp as u64;
    regs.pc = entry_trampoline as usize as u64;
    regs.x19_x28[0] = entry as usize as u64;
    regs.x19_x28[1] = arg as u64;
}

/// First code a fresh context executes
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry never returns
        "brk #0",
    );
}

/// Save the running context into `old` and resume `new`
///
/// # Safety
///
/// Same contract as the x86_64 version.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (x0)
        "mov x9, sp",
        "adr x10, 1f",
        "stp x9, x10, [x0, #0x00]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from new (x1)
        "ldp x9, x10, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "br x10",
        // Resume point of a context saved above
        "1:",
        "ret",
    );
}
