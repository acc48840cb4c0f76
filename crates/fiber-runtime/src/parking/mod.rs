//! Parking lot for idle workers
//!
//! A lot is a single futex word. Bit 0 is the stop flag; the bits above
//! count signals. A worker snapshots the word with `get_state()`, looks for
//! work once more, and only then calls `wait(state)`: any `signal()` issued
//! after the snapshot changes the word, so the futex refuses to sleep and no
//! wakeup is lost.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub(crate) use futex_linux::{futex_wait, futex_wake};
    } else {
        compile_error!("fiber-runtime parking requires Linux futexes");
    }
}

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Snapshot of a lot's word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkingState(u32);

impl ParkingState {
    #[inline]
    pub fn stopped(&self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Futex-backed wait/wake point shared by the workers of one tag
pub struct ParkingLot {
    pending_signal: AtomicU32,
    waiters: AtomicUsize,
}

impl ParkingLot {
    pub const fn new() -> Self {
        Self {
            pending_signal: AtomicU32::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn get_state(&self) -> ParkingState {
        ParkingState(self.pending_signal.load(Ordering::Acquire))
    }

    /// Wake up to `n` parked workers. Returns the number actually woken.
    pub fn signal(&self, n: usize) -> usize {
        let n = n.min(i32::MAX as usize) as u32;
        self.pending_signal
            .fetch_add(n.wrapping_shl(1), Ordering::Release);
        futex_wake(&self.pending_signal, n as i32)
    }

    /// Block until signalled, unless the word moved past `expected`.
    ///
    /// Returns at once if the lot is stopped. Spurious returns are allowed;
    /// callers loop.
    pub fn wait(&self, expected: ParkingState) {
        if expected.stopped() || self.get_state().stopped() {
            return;
        }
        self.waiters.fetch_add(1, Ordering::SeqCst);
        // EAGAIN / EINTR: the caller re-checks its queues anyway
        let _ = futex_wait(&self.pending_signal, expected.0, None);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Set the stop bit for good and release every waiter.
    pub fn stop(&self) {
        self.pending_signal.fetch_or(1, Ordering::Release);
        futex_wake(&self.pending_signal, 10000);
    }

    /// Threads currently inside `wait` (a hint)
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_signal_changes_state() {
        let lot = ParkingLot::new();
        let before = lot.get_state();
        assert_eq!(lot.signal(1), 0);
        let after = lot.get_state();
        assert_ne!(before, after);
        assert!(!after.stopped());
        assert_eq!(after.value() - before.value(), 2);
    }

    #[test]
    fn test_stale_state_does_not_block() {
        let lot = ParkingLot::new();
        let st = lot.get_state();
        lot.signal(1);
        // Would hang forever if the stale snapshot were honoured
        lot.wait(st);
    }

    #[test]
    fn test_wait_after_stop_never_blocks() {
        let lot = Arc::new(ParkingLot::new());
        let early = lot.get_state();
        lot.stop();
        assert!(lot.get_state().stopped());

        let start = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lot = lot.clone();
                thread::spawn(move || {
                    // Stale, fresh and forged states all return
                    lot.wait(early);
                    lot.wait(lot.get_state());
                    lot.wait(ParkingState((i as u32) << 1));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_releases_parked_waiters() {
        let lot = Arc::new(ParkingLot::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lot = lot.clone();
                thread::spawn(move || loop {
                    let st = lot.get_state();
                    if st.stopped() {
                        break;
                    }
                    lot.wait(st);
                })
            })
            .collect();
        assert!(wait_until(Duration::from_secs(5), || lot.waiter_count() == 4));
        lot.stop();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lot.waiter_count(), 0);
    }

    #[test]
    fn test_signal_one_wakes_exactly_one() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let lot = Arc::new(ParkingLot::new());
        let wakeups = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lot = lot.clone();
                let wakeups = wakeups.clone();
                thread::spawn(move || {
                    let st = lot.get_state();
                    if st.stopped() {
                        return;
                    }
                    lot.wait(st);
                    if !lot.get_state().stopped() {
                        wakeups.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        assert!(wait_until(Duration::from_secs(5), || lot.waiter_count() == 4));
        // futex_wait is entered right after the counter is bumped
        thread::sleep(Duration::from_millis(50));

        assert_eq!(lot.signal(1), 1);
        assert!(wait_until(Duration::from_secs(5), || wakeups.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
        assert_eq!(lot.waiter_count(), 3);

        lot.stop();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
    }
}
