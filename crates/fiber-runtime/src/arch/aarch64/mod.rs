//! AArch64 (AAPCS64) context switching
//!
//! Saved frame (0xb0 bytes): d8-d15, x19-x28, fp, lr, resume address, FPCR.
//! d8-d15 are callee-saved, so they are kept regardless of `preserve_fpu`.
//! FPCR is always saved and only reloaded when `preserve_fpu` is set.

use super::{ContextEntry, RawContext};
use std::arch::naked_asm;

#[unsafe(naked)]
pub(super) unsafe extern "C" fn fiber_make_context(
    _stack_top: *mut u8,
    _size: usize,
    _entry: ContextEntry,
) -> RawContext {
    naked_asm!(
        "and x0, x0, #0xfffffffffffffff0",
        "sub x0, x0, #0xb0",
        "str x2, [x0, #0xa0]",
        "str xzr, [x0, #0x90]",
        "adr x1, 3f",
        "str x1, [x0, #0x98]",
        "mrs x3, fpcr",
        "str x3, [x0, #0xa8]",
        "ret",
        "3:",
        "brk #0",
    );
}

#[unsafe(naked)]
pub(super) unsafe extern "C" fn fiber_jump_context(
    _from: *mut RawContext,
    _to: RawContext,
    _transfer: usize,
    _preserve_fpu: usize,
) -> usize {
    naked_asm!(
        "sub sp, sp, #0xb0",
        "stp d8, d9, [sp, #0x00]",
        "stp d10, d11, [sp, #0x10]",
        "stp d12, d13, [sp, #0x20]",
        "stp d14, d15, [sp, #0x30]",
        "stp x19, x20, [sp, #0x40]",
        "stp x21, x22, [sp, #0x50]",
        "stp x23, x24, [sp, #0x60]",
        "stp x25, x26, [sp, #0x70]",
        "stp x27, x28, [sp, #0x80]",
        "stp x29, x30, [sp, #0x90]",
        "str x30, [sp, #0xa0]",
        "mrs x5, fpcr",
        "str x5, [sp, #0xa8]",
        "mov x4, sp",
        "str x4, [x0]",
        "mov sp, x1",
        "cbz x3, 2f",
        "ldr x5, [sp, #0xa8]",
        "msr fpcr, x5",
        "2:",
        "ldp d8, d9, [sp, #0x00]",
        "ldp d10, d11, [sp, #0x10]",
        "ldp d12, d13, [sp, #0x20]",
        "ldp d14, d15, [sp, #0x30]",
        "ldp x19, x20, [sp, #0x40]",
        "ldp x21, x22, [sp, #0x50]",
        "ldp x23, x24, [sp, #0x60]",
        "ldp x25, x26, [sp, #0x70]",
        "ldp x27, x28, [sp, #0x80]",
        "ldp x29, x30, [sp, #0x90]",
        "mov x0, x2",
        "ldr x4, [sp, #0xa0]",
        "add sp, sp, #0xb0",
        "ret x4",
    );
}
