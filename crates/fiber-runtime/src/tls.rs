//! Thread-local access to the task group of the current worker
//!
//! A fiber may resume on a different worker after any switch, so the
//! accessors are never inlined and callers re-fetch the group after every
//! point where the fiber could have been suspended.

use crate::meta::FiberMeta;
use crate::task_group::TaskGroup;
use std::cell::Cell;
use std::ptr;

thread_local! {
    /// Group run by this OS thread, null on non-worker threads
    static CURRENT_GROUP: Cell<*const TaskGroup> = const { Cell::new(ptr::null()) };
}

/// Mark the calling thread as the worker of `group`
pub(crate) fn set_current_group(group: &TaskGroup) {
    CURRENT_GROUP.with(|cell| cell.set(group as *const TaskGroup));
}

pub(crate) fn clear_current_group() {
    let _ = CURRENT_GROUP.try_with(|cell| cell.set(ptr::null()));
}

/// Group of the calling worker.
///
/// The group outlives its worker's run loop, and fibers only run inside
/// that loop, so the reference is good until the caller next switches.
#[inline(never)]
pub(crate) fn current_group() -> Option<&'static TaskGroup> {
    let group = CURRENT_GROUP.try_with(|cell| cell.get()).ok()?;
    if group.is_null() {
        None
    } else {
        Some(unsafe { &*group })
    }
}

/// Group and control block when called from inside a fiber
#[inline(never)]
pub(crate) fn current_fiber() -> Option<(&'static TaskGroup, &'static FiberMeta)> {
    let group = current_group()?;
    group.current_meta().map(|meta| (group, meta))
}

/// True on a worker thread, whether inside a fiber or not
#[inline]
pub fn is_worker_thread() -> bool {
    current_group().is_some()
}

/// True when called from inside a fiber
#[inline]
pub fn in_fiber() -> bool {
    current_fiber().is_some()
}
