//! x86_64 (System V) context switching
//!
//! Frame left on a suspended stack, from the saved stack pointer upwards:
//!
//! ```text
//! +0x00  mxcsr (4 bytes) | x87 control word (2 bytes)
//! +0x08  r12
//! +0x10  r13
//! +0x18  r14
//! +0x20  r15
//! +0x28  rbx
//! +0x30  rbp
//! +0x38  resume address
//! +0x40  return address of the entry function (fresh contexts only)
//! ```
//!
//! The control words are always saved so the slot is valid whichever side
//! asks for `preserve_fpu`; they are only reloaded on request.

use super::{ContextEntry, RawContext};
use std::arch::naked_asm;

#[unsafe(naked)]
pub(super) unsafe extern "C" fn fiber_make_context(
    _stack_top: *mut u8,
    _size: usize,
    _entry: ContextEntry,
) -> RawContext {
    naked_asm!(
        "mov rax, rdi",
        "and rax, -16",
        "lea rax, [rax - 0x48]",
        "mov [rax + 0x38], rdx",
        "mov qword ptr [rax + 0x30], 0",
        "stmxcsr [rax]",
        "fnstcw [rax + 0x4]",
        "lea rcx, [rip + 3f]",
        "mov [rax + 0x40], rcx",
        "ret",
        // Entry functions never return
        "3:",
        "ud2",
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
        "push rbp",
        "push rbx",
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "lea rsp, [rsp - 0x8]",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 0x4]",
        // Publish our frame, adopt theirs
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "test rcx, rcx",
        "je 2f",
        "ldmxcsr [rsp]",
        "fldcw [rsp + 0x4]",
        "2:",
        "lea rsp, [rsp + 0x8]",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "pop rbx",
        "pop rbp",
        "pop r8",
        // Transfer value is both our return value and the first argument
        // of a fresh entry function
        "mov rax, rdx",
        "mov rdi, rdx",
        "jmp r8",
    );
}
