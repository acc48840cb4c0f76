//! Butex: a 32-bit word that fibers and OS threads can wait on
//!
//! `wait(expected, deadline)` blocks while the word equals `expected`.
//! A fiber waiting on a butex gives its worker back: the waiter record
//! lives on the fiber's stack and is queued by the worker's main loop only
//! after the fiber's context has been saved. OS threads block on a private
//! futex instead.
//!
//! Whoever dequeues a waiter (a waker, the timeout callback or an
//! interrupter) is the only party allowed to resume it, so the on-stack
//! record stays valid until that party is done with it.

use crate::parking::{futex_wait, futex_wake};
use crate::meta::FiberMeta;
use crate::task_group::{RemainedAction, TaskGroup};
use crate::timer::{global_timer, TimerId};
use crate::tls;
use fiber_core::error::ButexError;
use fiber_core::id::FiberId;
use fiber_core::state::FiberState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

const RC_WOKEN: u8 = 0;
const RC_TIMEDOUT: u8 = 1;
const RC_INTERRUPTED: u8 = 2;
const RC_WOULDBLOCK: u8 = 3;

pub(crate) enum WaiterKind {
    Fiber { id: FiberId, meta: &'static FiberMeta },
    Thread { sig: Arc<AtomicU32> },
}

/// One blocked waiter. Lives on the waiting fiber's (or thread's) stack.
pub(crate) struct ButexWaiter {
    kind: WaiterKind,
    expected: u32,
    butex: *const Butex,
    /// In `butex.waiters`; only changed under that lock
    queued: AtomicBool,
    deadline: Option<Instant>,
    /// Timeout callback id, 0 when none
    sleep_id: AtomicU64,
    rc: AtomicU8,
}

impl ButexWaiter {
    fn target(&self) -> WakeTarget {
        match &self.kind {
            WaiterKind::Fiber { id, meta } => WakeTarget::Fiber(*id, meta),
            WaiterKind::Thread { sig } => WakeTarget::Thread(sig.clone()),
        }
    }

    fn fiber_id(&self) -> Option<FiberId> {
        match &self.kind {
            WaiterKind::Fiber { id, .. } => Some(*id),
            WaiterKind::Thread { .. } => None,
        }
    }
}

/// Pointer to an on-stack `ButexWaiter`
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterRef(NonNull<ButexWaiter>);

// Only dereferenced while the owner is blocked (see module docs)
unsafe impl Send for WaiterRef {}

impl WaiterRef {
    fn new(waiter: &ButexWaiter) -> Self {
        WaiterRef(NonNull::from(waiter))
    }

    /// # Safety
    ///
    /// The waiter must still be blocked.
    unsafe fn get<'a>(self) -> &'a ButexWaiter {
        self.0.as_ref()
    }
}

enum WakeTarget {
    Fiber(FiberId, &'static FiberMeta),
    Thread(Arc<AtomicU32>),
}

impl WakeTarget {
    fn wake(self) {
        match self {
            WakeTarget::Fiber(id, meta) => wake_fiber(id, meta),
            WakeTarget::Thread(sig) => {
                sig.store(1, Ordering::Release);
                futex_wake(&sig, 1);
            }
        }
    }
}

/// Futex-like word usable from fibers and OS threads
pub struct Butex {
    value: AtomicU32,
    waiters: Mutex<VecDeque<WaiterRef>>,
}

impl Butex {
    pub const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            waiters: parking_lot::const_mutex(VecDeque::new()),
        }
    }

    /// The word itself; change it before waking
    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.value
    }

    /// Block while the word equals `expected`.
    ///
    /// - `Err(WouldBlock)`: the word already differed
    /// - `Err(TimedOut)`: `deadline` passed first
    /// - `Err(Interrupted)`: the fiber was interrupted (fibers only)
    ///
    /// `Ok(())` means woken, which may be spurious; callers re-check.
    pub fn wait(&self, expected: u32, deadline: Option<Instant>) -> Result<(), ButexError> {
        match tls::current_fiber() {
            Some((group, meta)) => self.wait_in_fiber(group, meta, expected, deadline),
            None => self.wait_in_thread(expected, deadline),
        }
    }

    /// Wake one waiter. Returns the number woken.
    pub fn wake(&self) -> usize {
        let target = {
            let mut q = self.waiters.lock();
            match q.pop_front() {
                Some(w) => {
                    let waiter = unsafe { w.get() };
                    waiter.queued.store(false, Ordering::Relaxed);
                    waiter.target()
                }
                None => return 0,
            }
        };
        target.wake();
        1
    }

    /// Wake up to `n` waiters in FIFO order. Returns the number woken.
    pub fn wake_n(&self, n: usize) -> usize {
        if n == 1 {
            return self.wake();
        }
        let targets: Vec<WakeTarget> = {
            let mut q = self.waiters.lock();
            let take = n.min(q.len());
            q.drain(..take)
                .map(|w| {
                    let waiter = unsafe { w.get() };
                    waiter.queued.store(false, Ordering::Relaxed);
                    waiter.target()
                })
                .collect()
        };
        let woken = targets.len();
        for target in targets {
            target.wake();
        }
        woken
    }

    pub fn wake_all(&self) -> usize {
        self.wake_n(usize::MAX)
    }

    /// Waiters currently queued (a hint)
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn wait_in_fiber(
        &self,
        group: &TaskGroup,
        meta: &'static FiberMeta,
        expected: u32,
        deadline: Option<Instant>,
    ) -> Result<(), ButexError> {
        if self.value.load(Ordering::Acquire) != expected {
            return Err(ButexError::WouldBlock);
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(ButexError::TimedOut);
        }
        if meta.interrupted.swap(false, Ordering::SeqCst) {
            return Err(ButexError::Interrupted);
        }

        let waiter = ButexWaiter {
            kind: WaiterKind::Fiber { id: meta.id(), meta },
            expected,
            butex: self,
            queued: AtomicBool::new(false),
            deadline,
            sleep_id: AtomicU64::new(0),
            rc: AtomicU8::new(RC_WOKEN),
        };
        meta.set_state(FiberState::Blocked);
        group.set_remained(RemainedAction::WaitForButex(WaiterRef::new(&waiter)));
        group.switch_to_main(meta);

        // Waits for an interrupter still holding the record
        *meta.current_waiter.lock() = None;
        let sleep_id = waiter.sleep_id.load(Ordering::Acquire);
        if sleep_id != 0 {
            if let Ok(timer) = global_timer() {
                timer.unschedule(TimerId(sleep_id));
            }
        }
        match waiter.rc.load(Ordering::Acquire) {
            RC_TIMEDOUT => Err(ButexError::TimedOut),
            RC_INTERRUPTED => {
                meta.interrupted.store(false, Ordering::SeqCst);
                Err(ButexError::Interrupted)
            }
            RC_WOULDBLOCK => Err(ButexError::WouldBlock),
            _ => Ok(()),
        }
    }

    fn wait_in_thread(&self, expected: u32, deadline: Option<Instant>) -> Result<(), ButexError> {
        if self.value.load(Ordering::Acquire) != expected {
            return Err(ButexError::WouldBlock);
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(ButexError::TimedOut);
        }

        let sig = Arc::new(AtomicU32::new(0));
        let waiter = ButexWaiter {
            kind: WaiterKind::Thread { sig: sig.clone() },
            expected,
            butex: self,
            queued: AtomicBool::new(false),
            deadline,
            sleep_id: AtomicU64::new(0),
            rc: AtomicU8::new(RC_WOKEN),
        };
        let w = WaiterRef::new(&waiter);
        {
            let mut q = self.waiters.lock();
            if self.value.load(Ordering::Relaxed) != expected {
                return Err(ButexError::WouldBlock);
            }
            q.push_back(w);
            waiter.queued.store(true, Ordering::Relaxed);
        }

        let mut deadline = deadline;
        while sig.load(Ordering::Acquire) == 0 {
            let timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        if dequeue(w, RC_TIMEDOUT).is_some() {
                            return Err(ButexError::TimedOut);
                        }
                        // A waker got there first; its signal is on the way
                        deadline = None;
                        continue;
                    }
                    Some(d - now)
                }
                None => None,
            };
            let _ = futex_wait(&sig, 0, timeout);
        }
        Ok(())
    }
}

impl Default for Butex {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for Butex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Butex")
            .field("value", &self.value.load(Ordering::Relaxed))
            .finish()
    }
}

/// Remove `w` from its butex, recording `rc`. `None` if someone else
/// dequeued it first.
fn dequeue(w: WaiterRef, rc: u8) -> Option<WakeTarget> {
    let waiter = unsafe { w.get() };
    let butex = unsafe { &*waiter.butex };
    let mut q = butex.waiters.lock();
    if !waiter.queued.load(Ordering::Relaxed) {
        return None;
    }
    if let Some(pos) = q.iter().position(|x| *x == w) {
        q.remove(pos);
    }
    waiter.queued.store(false, Ordering::Relaxed);
    waiter.rc.store(rc, Ordering::Release);
    Some(waiter.target())
}

fn erase_and_wake(w: WaiterRef, rc: u8) -> bool {
    match dequeue(w, rc) {
        Some(target) => {
            target.wake();
            true
        }
        None => false,
    }
}

/// Second half of a fiber's wait, run on the worker's own stack after the
/// fiber switched out.
pub(crate) fn wait_for_butex(group: &TaskGroup, w: WaiterRef) {
    let waiter = unsafe { w.get() };
    let WaiterKind::Fiber { id, meta } = waiter.kind else {
        return;
    };
    // Published before the butex lock so interrupt() can always find it
    *meta.current_waiter.lock() = Some(w);

    let butex = unsafe { &*waiter.butex };
    let mut q = butex.waiters.lock();
    let rc = if butex.value.load(Ordering::Relaxed) != waiter.expected {
        RC_WOULDBLOCK
    } else if meta.interrupted.swap(false, Ordering::SeqCst) {
        RC_INTERRUPTED
    } else {
        q.push_back(w);
        waiter.queued.store(true, Ordering::Relaxed);
        let Some(deadline) = waiter.deadline else {
            return;
        };
        let scheduled = global_timer()
            .and_then(|timer| timer.schedule(move || {
                erase_and_wake(w, RC_TIMEDOUT);
            }, deadline));
        match scheduled {
            Ok(sleep_id) => {
                waiter.sleep_id.store(sleep_id.as_u64(), Ordering::Release);
                return;
            }
            Err(e) => {
                tracing::error!(fiber = %id, error = %e, "cannot arm butex timeout");
                q.pop_back();
                waiter.queued.store(false, Ordering::Relaxed);
                RC_TIMEDOUT
            }
        }
    };
    waiter.rc.store(rc, Ordering::Release);
    drop(q);
    group.ready_to_run(id, false);
}

/// Wake `id` out of whatever butex it is blocked on with `Interrupted`.
/// Returns false when it was not blocked.
pub(crate) fn interrupt_waiter(meta: &'static FiberMeta, id: FiberId) -> bool {
    let current = meta.current_waiter.lock();
    match *current {
        Some(w) if unsafe { w.get() }.fiber_id() == Some(id) => erase_and_wake(w, RC_INTERRUPTED),
        _ => false,
    }
}

/// Make a fiber that left a butex queue runnable again.
fn wake_fiber(id: FiberId, meta: &'static FiberMeta) {
    let Some(control) = (unsafe { meta.control() }) else {
        tracing::warn!(fiber = %id, "woken fiber has no runtime");
        return;
    };
    let tag = meta.tag();
    match tls::current_group() {
        Some(group) if group.serves(&control, tag) => group.ready_to_run(id, false),
        _ => control.ready_to_run_remote(id, tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_would_block() {
        let b = Butex::new(5);
        assert_eq!(b.wait(4, None), Err(ButexError::WouldBlock));
        assert_eq!(b.waiter_count(), 0);
    }

    #[test]
    fn test_thread_timeout() {
        let b = Butex::new(0);
        let start = Instant::now();
        let r = b.wait(0, Some(start + Duration::from_millis(30)));
        assert_eq!(r, Err(ButexError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(b.waiter_count(), 0);

        // Deadline already passed
        assert_eq!(b.wait(0, Some(start)), Err(ButexError::TimedOut));
    }

    #[test]
    fn test_thread_wake_one() {
        let b = Arc::new(Butex::new(0));
        let b2 = b.clone();
        let h = thread::spawn(move || {
            while b2.value().load(Ordering::Acquire) == 0 {
                let _ = b2.wait(0, None);
            }
        });
        while b.waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        b.value().store(1, Ordering::Release);
        assert_eq!(b.wake(), 1);
        h.join().unwrap();
        assert_eq!(b.wake(), 0);
    }

    #[test]
    fn test_thread_wake_all() {
        let b = Arc::new(Butex::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = b.clone();
                thread::spawn(move || {
                    while b.value().load(Ordering::Acquire) == 0 {
                        let _ = b.wait(0, None);
                    }
                })
            })
            .collect();
        while b.waiter_count() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        b.value().store(1, Ordering::Release);
        assert_eq!(b.wake_all(), 4);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_wake_n_is_fifo_bounded() {
        let b = Arc::new(Butex::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                thread::spawn(move || b.wait(0, Some(Instant::now() + Duration::from_secs(10))))
            })
            .collect();
        while b.waiter_count() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(b.wake_n(2), 2);
        assert_eq!(b.waiter_count(), 1);
        assert_eq!(b.wake_n(5), 1);
        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(()));
        }
    }
}
