//! Countdown event: wait until a counter drops to zero

use crate::butex::Butex;
use fiber_core::error::{ButexError, FiberError, FiberResult};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Counter that releases every waiter once it reaches zero or below.
///
/// ```ignore
/// let done = Arc::new(CountdownEvent::new(2));
/// for _ in 0..2 {
///     let done = done.clone();
///     fiber::spawn(move || done.signal(1))?.detach();
/// }
/// done.wait();
/// ```
#[derive(Debug)]
pub struct CountdownEvent {
    butex: Butex,
}

impl CountdownEvent {
    pub fn new(count: i32) -> Self {
        Self {
            butex: Butex::new(count as u32),
        }
    }

    /// Current value of the counter
    #[inline]
    pub fn count(&self) -> i32 {
        self.butex.value().load(Ordering::Acquire) as i32
    }

    /// Decrease the counter by `n`, waking every waiter if it reaches zero.
    pub fn signal(&self, n: i32) {
        let prev = self.butex.value().fetch_sub(n as u32, Ordering::AcqRel) as i32;
        if prev > n {
            return;
        }
        self.butex.wake_all();
    }

    /// Increase the counter by `n`.
    pub fn add_count(&self, n: i32) {
        self.butex.value().fetch_add(n as u32, Ordering::AcqRel);
    }

    /// Set the counter to `n` for another round of waits.
    pub fn reset(&self, n: i32) {
        self.butex.value().store(n as u32, Ordering::Release);
    }

    /// Block until the counter is zero or below.
    ///
    /// Interruption (including `stop`) does not end the wait.
    pub fn wait(&self) {
        loop {
            let v = self.butex.value().load(Ordering::Acquire);
            if v as i32 <= 0 {
                return;
            }
            // Woken, value moved or interrupted: check again
            let _ = self.butex.wait(v, None);
        }
    }

    /// Like `wait`, giving up at `deadline` with `Err(TimedOut)`.
    pub fn timed_wait(&self, deadline: Instant) -> FiberResult<()> {
        loop {
            let v = self.butex.value().load(Ordering::Acquire);
            if v as i32 <= 0 {
                return Ok(());
            }
            match self.butex.wait(v, Some(deadline)) {
                Err(ButexError::TimedOut) => {
                    return if self.count() <= 0 {
                        Ok(())
                    } else {
                        Err(FiberError::TimedOut)
                    };
                }
                _ => continue,
            }
        }
    }
}

impl Default for CountdownEvent {
    fn default() -> Self {
        Self::new(1)
    }
}
