//! Condition variable paired with `FiberMutex`

use super::mutex::{FiberMutex, FiberMutexGuard};
use crate::butex::Butex;
use fiber_core::error::ButexError;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Condition variable for fibers and threads.
///
/// The butex value is a sequence number bumped by every notification. A
/// waiter samples it while still holding the mutex, so a notification
/// sent after the unlock is never lost.
///
/// ```ignore
/// let mut ready = lock.lock();
/// while !*ready {
///     ready = cond.wait(ready);
/// }
/// ```
#[derive(Debug)]
pub struct FiberCondvar {
    seq: Butex,
}

impl FiberCondvar {
    pub const fn new() -> Self {
        Self { seq: Butex::new(0) }
    }

    /// Release the lock, sleep until notified, then lock again.
    ///
    /// Wakeups may be spurious; callers re-check their condition.
    pub fn wait<'a, T: ?Sized>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let seq = self.seq.value().load(Ordering::Acquire);
        let mutex = Self::release(guard);
        // Interruption counts as a spurious wakeup
        let _ = self.seq.wait(seq, None);
        mutex.lock()
    }

    /// Like `wait`, also returning once `deadline` passes. The flag is
    /// true when the wait timed out.
    pub fn wait_until<'a, T: ?Sized>(
        &self,
        guard: FiberMutexGuard<'a, T>,
        deadline: Instant,
    ) -> (FiberMutexGuard<'a, T>, bool) {
        let seq = self.seq.value().load(Ordering::Acquire);
        let mutex = Self::release(guard);
        let timed_out = matches!(self.seq.wait(seq, Some(deadline)), Err(ButexError::TimedOut));
        (mutex.lock(), timed_out)
    }

    /// Wait until `condition` returns false.
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: FiberMutexGuard<'a, T>,
        mut condition: F,
    ) -> FiberMutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.seq.value().fetch_add(1, Ordering::Release);
        self.seq.wake();
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.seq.value().fetch_add(1, Ordering::Release);
        self.seq.wake_all();
    }

    fn release<'a, T: ?Sized>(guard: FiberMutexGuard<'a, T>) -> &'a FiberMutex<T> {
        let mutex = guard.mutex;
        drop(guard);
        mutex
    }
}

impl Default for FiberCondvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_notify_one_wakes_waiter() {
        let pair = Arc::new((FiberMutex::new(false), FiberCondvar::new()));
        let p = pair.clone();
        let waiter = thread::spawn(move || {
            let (lock, cond) = &*p;
            let ready = cond.wait_while(lock.lock(), |ready| !*ready);
            *ready
        });

        thread::sleep(Duration::from_millis(10));
        let (lock, cond) = &*pair;
        *lock.lock() = true;
        cond.notify_one();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_notify_all_wakes_everyone() {
        let pair = Arc::new((FiberMutex::new(0u32), FiberCondvar::new()));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let p = pair.clone();
                thread::spawn(move || {
                    let (lock, cond) = &*p;
                    let mut round = lock.lock();
                    while *round == 0 {
                        round = cond.wait(round);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        let (lock, cond) = &*pair;
        *lock.lock() = 1;
        cond.notify_all();
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_wait_until_times_out_with_lock_held() {
        let lock = FiberMutex::new(());
        let cond = FiberCondvar::new();
        let start = Instant::now();
        let (guard, timed_out) = cond.wait_until(lock.lock(), start + Duration::from_millis(20));
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }
}
