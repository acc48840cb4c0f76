//! Fiber operations addressed by id
//!
//! These work from fibers and from plain threads. Creation goes to the
//! runtime of the calling worker, or to the global runtime elsewhere.

use crate::butex::{self, Butex};
use crate::meta;
use crate::task_control::{task_control, TaskControl};
use crate::tls;
use fiber_core::attr::{FiberAttr, LaunchPolicy};
use fiber_core::error::{ButexError, FiberError, FiberResult};
use fiber_core::id::FiberId;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Runtime of the calling worker, or the global one
pub fn current_control() -> FiberResult<Arc<TaskControl>> {
    match tls::current_group() {
        Some(group) => Ok(group.control().clone()),
        None => task_control().cloned(),
    }
}

/// Create a fiber with `attr`.
pub fn start<F>(attr: FiberAttr, f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    current_control()?.start(attr, f)
}

/// Create a fiber that runs right away when called from a fiber.
pub fn start_urgent<F>(f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    start(FiberAttr::new().launch(LaunchPolicy::Immediately), f)
}

/// Create a fiber that is only queued.
pub fn start_background<F>(f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    start(FiberAttr::new().launch(LaunchPolicy::Lazy), f)
}

/// Wait until `id` has finished.
///
/// Returns at once for an id that already finished. Interruption does not
/// end the wait.
pub fn join(id: FiberId) -> FiberResult<()> {
    let meta = meta::meta_of(id).ok_or(FiberError::NotFound)?;
    if self_id() == Some(id) {
        return Err(FiberError::InvalidArgument("a fiber cannot join itself"));
    }
    loop {
        let version = meta.version();
        if version != id.version() {
            return Ok(());
        }
        match meta.version_butex.wait(version, None) {
            Ok(()) | Err(ButexError::WouldBlock) | Err(ButexError::Interrupted) => continue,
            Err(ButexError::TimedOut) => continue,
        }
    }
}

/// Ask `id` to stop and wake it from any butex wait.
///
/// Advisory: the fiber sees `stopped()` and an `Interrupted` wait, but
/// countdown waits, mutex locks and joins keep waiting.
pub fn stop(id: FiberId) -> FiberResult<()> {
    let meta = meta::meta_of(id).ok_or(FiberError::NotFound)?;
    {
        let _guard = meta.version_lock.lock();
        if !meta.is_current(id) {
            return Err(FiberError::NotFound);
        }
        meta.stop.store(true, Ordering::SeqCst);
    }
    interrupt(id)
}

/// Wake `id` from a butex wait with `Interrupted`. If it is not waiting,
/// its next wait returns `Interrupted` instead.
pub fn interrupt(id: FiberId) -> FiberResult<()> {
    let meta = meta::meta_of(id).ok_or(FiberError::NotFound)?;
    {
        let _guard = meta.version_lock.lock();
        if !meta.is_current(id) {
            return Err(FiberError::NotFound);
        }
        meta.interrupted.store(true, Ordering::SeqCst);
    }
    butex::interrupt_waiter(meta, id);
    Ok(())
}

/// True once `stop(id)` was called, or when `id` no longer exists.
pub fn stopped(id: FiberId) -> bool {
    match meta::meta_of(id) {
        Some(meta) => !meta.is_current(id) || meta.stop.load(Ordering::SeqCst),
        None => true,
    }
}

/// True while `id` has not finished
pub fn exists(id: FiberId) -> bool {
    meta::meta_of(id).is_some_and(|meta| meta.is_current(id))
}

/// Id of the calling fiber
pub fn self_id() -> Option<FiberId> {
    tls::current_fiber().map(|(_, meta)| meta.id())
}

/// Tag of the worker running the caller, `None` outside workers
pub fn self_tag() -> Option<usize> {
    tls::current_group().map(|group| group.tag())
}

/// Let other fibers run. Yields the OS thread outside fibers.
pub fn yield_now() {
    match tls::current_fiber() {
        Some((group, meta)) => group.yield_current(meta),
        None => thread::yield_now(),
    }
}

/// Suspend the calling fiber for `duration` without blocking its worker.
///
/// - `Err(Stopped)`: the fiber was stopped (before or during the sleep)
/// - `Err(Interrupted)`: woken early by `interrupt`
///
/// Outside fibers this is `thread::sleep`.
pub fn sleep(duration: Duration) -> FiberResult<()> {
    let Some((_, meta)) = tls::current_fiber() else {
        thread::sleep(duration);
        return Ok(());
    };
    if meta.stop.load(Ordering::SeqCst) {
        return Err(FiberError::Stopped);
    }
    let deadline = Instant::now() + duration;
    let butex = Butex::new(0);
    loop {
        match butex.wait(0, Some(deadline)) {
            Err(ButexError::TimedOut) => return Ok(()),
            Err(ButexError::Interrupted) => {
                // Re-read the meta: the fiber may be on another worker now
                return match tls::current_fiber() {
                    Some((_, meta)) if meta.stop.load(Ordering::SeqCst) => Err(FiberError::Stopped),
                    _ => Err(FiberError::Interrupted),
                };
            }
            // Nobody else can reach this butex; treat as spurious
            Ok(()) | Err(ButexError::WouldBlock) => continue,
        }
    }
}

/// Signal workers for fibers queued with the `NOSIGNAL` flag.
pub fn flush() {
    match tls::current_group() {
        Some(group) => {
            group.flush_nosignal_tasks();
            group.flush_nosignal_tasks_remote();
        }
        None => {
            if let Ok(control) = task_control() {
                control.flush_remote_all();
            }
        }
    }
}

/// A set of fibers stopped or joined together.
///
/// Ids are kept until `join_all`; finished fibers cost nothing to stop or
/// join, so nothing needs to be removed as they exit.
#[derive(Debug, Default)]
pub struct FiberList {
    ids: Mutex<Vec<FiberId>>,
}

impl FiberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: FiberId) {
        self.ids.lock().push(id);
    }

    /// Start a fiber and add it to the list.
    pub fn start<F>(&self, attr: FiberAttr, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = start(attr, f)?;
        self.add(id);
        Ok(id)
    }

    /// `stop` every fiber that has not finished yet. Returns how many
    /// were still running.
    pub fn stop_all(&self) -> usize {
        let ids = self.ids.lock().clone();
        ids.into_iter().filter(|&id| stop(id).is_ok()).count()
    }

    /// Join every fiber and empty the list.
    pub fn join_all(&self) -> FiberResult<()> {
        let ids = std::mem::take(&mut *self.ids.lock());
        for id in ids {
            match join(id) {
                // Already gone
                Ok(()) | Err(FiberError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_fiber() {
        assert!(self_id().is_none());
        assert!(sleep(Duration::from_millis(1)).is_ok());
        yield_now();
    }

    #[test]
    fn test_unknown_ids() {
        let bogus = FiberId::new(7, u32::MAX);
        assert_eq!(join(bogus), Err(FiberError::NotFound));
        assert_eq!(stop(bogus), Err(FiberError::NotFound));
        assert!(stopped(bogus));
        assert!(!exists(bogus));
        assert!(!exists(FiberId::INVALID));
    }

    #[test]
    fn test_empty_and_stale_list() {
        assert!(self_tag().is_none());
        let list = FiberList::new();
        assert!(list.is_empty());
        list.add(FiberId::new(7, u32::MAX));
        assert_eq!(list.len(), 1);
        assert_eq!(list.stop_all(), 0);
        assert!(list.join_all().is_ok());
        assert!(list.is_empty());
    }
}
