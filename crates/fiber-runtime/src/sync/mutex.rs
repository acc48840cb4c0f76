//! Mutex that blocks the calling fiber instead of its worker

use crate::butex::Butex;
use fiber_core::error::{ButexError, FiberError, FiberResult};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::time::Instant;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Locked with possible waiters; unlock must wake one
const CONTENDED: u32 = 257;

/// Mutual exclusion for fibers and threads.
///
/// A contended `lock()` parks the fiber on a butex so its worker keeps
/// running other fibers.
pub struct FiberMutex<T: ?Sized> {
    butex: Butex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for FiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            butex: Butex::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberMutex<T> {
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }
        loop {
            if self.butex.value().swap(CONTENDED, Ordering::Acquire) & LOCKED == 0 {
                return FiberMutexGuard { mutex: self };
            }
            // Interrupted or spurious: retry
            let _ = self.butex.wait(CONTENDED, None);
        }
    }

    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        self.butex
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FiberMutexGuard { mutex: self })
    }

    /// Like `lock`, giving up with `Err(TimedOut)` at `deadline`.
    pub fn timed_lock(&self, deadline: Instant) -> FiberResult<FiberMutexGuard<'_, T>> {
        if let Some(guard) = self.try_lock() {
            return Ok(guard);
        }
        loop {
            if self.butex.value().swap(CONTENDED, Ordering::Acquire) & LOCKED == 0 {
                return Ok(FiberMutexGuard { mutex: self });
            }
            if let Err(ButexError::TimedOut) = self.butex.wait(CONTENDED, Some(deadline)) {
                return Err(FiberError::TimedOut);
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.butex.value().load(Ordering::Relaxed) & LOCKED != 0
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        let prev = self.butex.value().swap(UNLOCKED, Ordering::Release);
        if prev != LOCKED {
            self.butex.wake();
        }
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FiberMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// Releases the lock when dropped
pub struct FiberMutexGuard<'a, T: ?Sized> {
    pub(super) mutex: &'a FiberMutex<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for FiberMutexGuard<'_, T> {}

impl<T: ?Sized> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_lock() {
        let m = FiberMutex::new(5);
        let g = m.try_lock().unwrap();
        assert!(m.is_locked());
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(!m.is_locked());
        *m.lock() += 1;
        assert_eq!(m.into_inner(), 6);
    }

    #[test]
    fn test_contended_threads() {
        let m = Arc::new(FiberMutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }

    #[test]
    fn test_timed_lock_times_out() {
        let m = Arc::new(FiberMutex::new(()));
        let g = m.lock();
        let m2 = m.clone();
        let r = thread::spawn(move || {
            m2.timed_lock(Instant::now() + Duration::from_millis(20)).is_err()
        })
        .join()
        .unwrap();
        assert!(r);
        drop(g);
        assert!(m.timed_lock(Instant::now() + Duration::from_millis(20)).is_ok());
    }
}
