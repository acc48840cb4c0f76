//! Reader-writer lock that blocks fibers instead of workers

use super::mutex::{FiberMutex, FiberMutexGuard};
use crate::butex::Butex;
use fiber_core::error::{ButexError, FiberError, FiberResult};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Set while a writer holds the lock or waits for readers to drain
const WRITER: u32 = 1 << 31;
const READERS: u32 = WRITER - 1;

/// Many readers or one writer, writers first.
///
/// The butex word holds the reader count and a writer bit. Writers queue
/// on an inner mutex; the one at the head sets the writer bit, which turns
/// new readers away, then sleeps until the readers inside have left.
pub struct FiberRwLock<T: ?Sized> {
    state: Butex,
    writers: FiberMutex<()>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for FiberRwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for FiberRwLock<T> {}

impl<T> FiberRwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: Butex::new(0),
            writers: FiberMutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberRwLock<T> {
    pub fn read(&self) -> FiberRwLockReadGuard<'_, T> {
        loop {
            match self.try_acquire_read() {
                Ok(()) => return FiberRwLockReadGuard { lock: self },
                Err(seen) => {
                    let _ = self.state.wait(seen, None);
                }
            }
        }
    }

    pub fn try_read(&self) -> Option<FiberRwLockReadGuard<'_, T>> {
        self.try_acquire_read()
            .ok()
            .map(|_| FiberRwLockReadGuard { lock: self })
    }

    /// Like `read`, giving up with `Err(TimedOut)` at `deadline`.
    pub fn timed_read(&self, deadline: Instant) -> FiberResult<FiberRwLockReadGuard<'_, T>> {
        loop {
            match self.try_acquire_read() {
                Ok(()) => return Ok(FiberRwLockReadGuard { lock: self }),
                Err(seen) => {
                    if let Err(ButexError::TimedOut) = self.state.wait(seen, Some(deadline)) {
                        return Err(FiberError::TimedOut);
                    }
                }
            }
        }
    }

    pub fn write(&self) -> FiberRwLockWriteGuard<'_, T> {
        let queued = self.writers.lock();
        self.state.value().fetch_or(WRITER, Ordering::Acquire);
        loop {
            let seen = self.state.value().load(Ordering::Acquire);
            if seen & READERS == 0 {
                return FiberRwLockWriteGuard { lock: self, _queued: queued };
            }
            let _ = self.state.wait(seen, None);
        }
    }

    pub fn try_write(&self) -> Option<FiberRwLockWriteGuard<'_, T>> {
        let queued = self.writers.try_lock()?;
        self.state
            .value()
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FiberRwLockWriteGuard { lock: self, _queued: queued })
    }

    /// Like `write`, giving up with `Err(TimedOut)` at `deadline`.
    pub fn timed_write(&self, deadline: Instant) -> FiberResult<FiberRwLockWriteGuard<'_, T>> {
        let queued = self.writers.timed_lock(deadline)?;
        self.state.value().fetch_or(WRITER, Ordering::Acquire);
        loop {
            let seen = self.state.value().load(Ordering::Acquire);
            if seen & READERS == 0 {
                return Ok(FiberRwLockWriteGuard { lock: self, _queued: queued });
            }
            if let Err(ButexError::TimedOut) = self.state.wait(seen, Some(deadline)) {
                // Let the readers turned away in the meantime back in
                self.state.value().fetch_and(!WRITER, Ordering::Release);
                self.state.wake_all();
                return Err(FiberError::TimedOut);
            }
        }
    }

    /// Number of read locks held
    pub fn reader_count(&self) -> u32 {
        self.state.value().load(Ordering::Relaxed) & READERS
    }

    /// True while a writer holds the lock or waits for readers to leave
    pub fn has_writer(&self) -> bool {
        self.state.value().load(Ordering::Relaxed) & WRITER != 0
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Take one read lock, or return the state that prevented it.
    fn try_acquire_read(&self) -> Result<(), u32> {
        let word = self.state.value();
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            if cur & WRITER != 0 || cur & READERS == READERS {
                return Err(cur);
            }
            match word.compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    fn read_unlock(&self) {
        let prev = self.state.value().fetch_sub(1, Ordering::Release);
        // Last reader out: a pending writer, or readers held back by the
        // reader limit, may be sleeping
        if prev & READERS == 1 || prev & READERS == READERS {
            self.state.wake_all();
        }
    }

    fn write_unlock(&self) {
        self.state.value().fetch_and(!WRITER, Ordering::Release);
        self.state.wake_all();
    }
}

impl<T: Default> Default for FiberRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FiberRwLock");
        match self.try_read() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// Shared access; releases the read lock when dropped
pub struct FiberRwLockReadGuard<'a, T: ?Sized> {
    lock: &'a FiberRwLock<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for FiberRwLockReadGuard<'_, T> {}

impl<T: ?Sized> Deref for FiberRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FiberRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive access; releases the write lock when dropped, then lets the
/// next queued writer in
pub struct FiberRwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a FiberRwLock<T>,
    _queued: FiberMutexGuard<'a, ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for FiberRwLockWriteGuard<'_, T> {}

impl<T: ?Sized> Deref for FiberRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FiberRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FiberRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
