//! Architecture-specific context switching
//!
//! The scheduler only ever sees the two functions exported here:
//!
//! - `make_context(stack_top, size, entry)` prepares a suspended context on a
//!   caller-provided stack. Nothing is allocated and nothing is validated.
//! - `jump_context(from, to, transfer, preserve_fpu)` saves the current
//!   callee-saved state into `*from`, resumes `to`, and returns whatever
//!   `transfer` value the context that later jumps back to `from` passes.
//!
//! A fresh context starts in `entry(transfer)`. Entry functions must never
//! return; the return address planted below them traps.

use std::ffi::c_void;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64 as imp;
    } else {
        compile_error!("fiber-runtime supports x86_64 and aarch64 only");
    }
}

/// Entry point of a fresh context. Receives the first transfer value.
pub type ContextEntry = extern "C" fn(usize) -> !;

/// Saved stack pointer of a suspended context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RawContext(*mut c_void);

impl RawContext {
    pub const fn null() -> Self {
        RawContext(std::ptr::null_mut())
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

// A context is an address on a stack owned elsewhere; moving the value
// between threads is how fibers migrate between workers.
unsafe impl Send for RawContext {}

/// Prepare a context that will start at `entry` on the given stack.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable region of at least
/// `size` bytes that stays alive while the context is in use.
#[inline]
pub unsafe fn make_context(stack_top: *mut u8, size: usize, entry: ContextEntry) -> RawContext {
    imp::fiber_make_context(stack_top, size, entry)
}

/// Switch from the running context to `to`.
///
/// # Safety
///
/// `to` must be a context produced by `make_context` or saved by a previous
/// `jump_context`, and must not be running on any thread.
#[inline]
pub unsafe fn jump_context(
    from: *mut RawContext,
    to: RawContext,
    transfer: usize,
    preserve_fpu: bool,
) -> usize {
    imp::fiber_jump_context(from, to, transfer, preserve_fpu as usize)
}
