//! Unix stack allocation using mmap

use fiber_core::attr::StackTier;
use fiber_core::error::StackError;
use nix::errno::Errno;
use std::ptr::NonNull;

/// System page size
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

#[inline]
pub(crate) fn round_to_page(n: usize, page: usize) -> usize {
    n.div_ceil(page) * page
}

/// A mapped fiber stack.
///
/// ```text
///   base                base + guard                    base + mapped
///    │ guard (PROT_NONE) │ usable stack (RW) ... grows ◄── │ top
/// ```
///
/// Move-only; the mapping is released on drop.
pub struct Stack {
    base: NonNull<u8>,
    mapped: usize,
    guard: usize,
    tier: StackTier,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for Stack {}

impl Stack {
    /// Map `size` usable bytes plus a `guard` region below them.
    /// Both are rounded up to whole pages.
    pub fn allocate(size: usize, guard: usize, tier: StackTier) -> Result<Stack, StackError> {
        let page = page_size();
        let size = round_to_page(size.max(page), page);
        let guard = round_to_page(guard, page);
        let mapped = size + guard;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Map { size: mapped, errno: Errno::last() as i32 });
        }

        if guard > 0 {
            let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
            if ret != 0 {
                let errno = Errno::last() as i32;
                unsafe { libc::munmap(base, mapped) };
                return Err(StackError::Protect { errno });
            }
        }

        // mmap never returns null on success
        let base = NonNull::new(base as *mut u8).ok_or(StackError::Map { size: mapped, errno: 0 })?;
        Ok(Stack { base, mapped, guard, tier })
    }

    /// Highest address; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Lowest usable address, just above the guard
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.mapped - self.guard
    }

    #[inline]
    pub fn guard_size(&self) -> usize {
        self.guard
    }

    #[inline]
    pub fn tier(&self) -> StackTier {
        self.tier
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped) };
        if ret != 0 {
            tracing::warn!(errno = %Errno::last(), size = self.mapped, "munmap of fiber stack failed");
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .field("guard", &self.guard)
            .field("tier", &self.tier)
            .finish()
    }
}
