//! Linux futex wrappers
//!
//! Private (process-local) futexes only. `FUTEX_WAIT` takes a relative
//! timeout.

use nix::errno::Errno;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`.
///
/// Returns `Ok(())` when woken (or spuriously), `Err(EAGAIN)` when the word
/// already differed, `Err(ETIMEDOUT)` / `Err(EINTR)` as reported by the
/// kernel. Callers re-check their condition in every case.
pub(crate) fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<(), Errno> {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(i64::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map(|t| t as *const libc::timespec)
        .unwrap_or(std::ptr::null());

    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(Errno::last())
    }
}

/// Wake up to `n` threads blocked on `word`. Returns how many were woken.
pub(crate) fn futex_wake(word: &AtomicU32, n: i32) -> usize {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret < 0 {
        0
    } else {
        ret as usize
    }
}
