//! # fiber - M:N fiber scheduler
//!
//! Lightweight userspace threads multiplexed onto a pool of worker
//! threads. Each worker owns a run queue; idle workers steal from the
//! others and sleep in parking lots when there is nothing to do.
//!
//! ## Features
//!
//! - **Cheap creation**: stacks come from a per-thread pool in four size tiers
//! - **Fast switches**: hand-written assembly, callee-saved registers only
//! - **Blocking without blocking**: butex, mutex, countdown and sleep park the fiber, not the worker
//! - **Tags**: disjoint worker sets so latency-sensitive fibers never share workers with batch work
//! - **Fiber-local storage**: key tables borrowed from a pool
//!
//! ## Quick Start
//!
//! ```ignore
//! use fiber::{Runtime, FiberConfig, CountdownEvent};
//! use std::sync::Arc;
//!
//! let rt = Runtime::new(FiberConfig::default()).unwrap();
//! let done = Arc::new(CountdownEvent::new(2));
//!
//! for i in 0..2 {
//!     let done = done.clone();
//!     rt.spawn(move || {
//!         println!("hello from fiber {i}");
//!         done.signal(1);
//!     })
//!     .unwrap()
//!     .detach();
//! }
//! done.wait();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │         spawn(), join(), sleep(), FiberMutex, keys          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Task Control                            │
//! │     tags, worker groups, parking lots, signal and steal     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ TaskGroup │      │ TaskGroup │      │   Timer   │
//!    │ (worker)  │      │ (worker)  │      │   Thread  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          └─────────┬─────────┘
//!                    ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │          Control blocks, stack pool, key tables          │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use fiber_core::{
    constants, key_create, key_delete, ButexError, FiberAttr, FiberError, FiberFlags, FiberId,
    FiberKey, FiberResult, FiberState, KeyDestructor, KeyTable, KeytablePool, LaunchPolicy,
    StackError, StackTier, WorkerState,
};

// Re-export runtime types
pub use fiber_runtime::{
    current_control, exists, flush, in_fiber, init_global, interrupt, is_worker_thread, join,
    self_id, self_tag, set_specific, sleep, start, start_background, start_urgent, stop,
    stopped, take_specific, task_control, with_specific, yield_now, Butex, ConfigError,
    CountdownEvent, FiberBarrier, FiberCondvar, FiberConfig, FiberList, FiberMutex,
    FiberMutexGuard, FiberRwLock, FiberRwLockReadGuard, FiberRwLockWriteGuard, GroupStats,
    TaskControl,
};

// Re-export env utilities
pub use fiber_runtime::config::env::{env_get, env_get_bool};

use std::sync::Arc;

/// Owned handle to a started fiber.
///
/// Every handle must be consumed by `join` or `detach`. Dropping an
/// unconsumed handle aborts the process: a fiber nobody waits for and
/// nobody released is a leak the program cannot notice otherwise.
#[must_use = "a Fiber must be joined or detached"]
pub struct Fiber {
    id: FiberId,
    consumed: bool,
}

impl Fiber {
    fn new(id: FiberId) -> Self {
        Self { id, consumed: false }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Wait for the fiber to finish.
    pub fn join(mut self) -> FiberResult<()> {
        self.consumed = true;
        fiber_runtime::join(self.id)
    }

    /// Let the fiber finish on its own. Returns its id, which stays
    /// usable with `stop`, `interrupt` and `join`.
    pub fn detach(mut self) -> FiberId {
        self.consumed = true;
        self.id
    }

    /// Ask the fiber to stop. See [`stop`].
    pub fn stop(&self) -> FiberResult<()> {
        fiber_runtime::stop(self.id)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if !self.consumed {
            tracing::error!(id = ?self.id, "fiber handle dropped without join or detach");
            std::process::abort();
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fiber").field(&self.id).finish()
    }
}

/// Start a fiber with default attributes on the current runtime.
pub fn spawn<F>(f: F) -> FiberResult<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    spawn_with(FiberAttr::default(), f)
}

/// Start a fiber with `attr` on the current runtime.
pub fn spawn_with<F>(attr: FiberAttr, f: F) -> FiberResult<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    fiber_runtime::start(attr, f).map(Fiber::new)
}

/// A private scheduler instance
///
/// Fibers started through a `Runtime` run on its workers. Fibers they start
/// in turn (via the free functions) stay on the same runtime.
pub struct Runtime {
    control: Arc<TaskControl>,
}

impl Runtime {
    /// Start the workers described by `config`.
    pub fn new(config: FiberConfig) -> FiberResult<Self> {
        Ok(Self {
            control: TaskControl::new(config)?,
        })
    }

    pub fn control(&self) -> &Arc<TaskControl> {
        &self.control
    }

    pub fn spawn<F>(&self, f: F) -> FiberResult<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start(FiberAttr::default(), f)
    }

    pub fn start<F>(&self, attr: FiberAttr, f: F) -> FiberResult<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        self.control.start(attr, f).map(Fiber::new)
    }

    /// Run `f` in a fiber and wait for its result from this thread.
    pub fn block_on<F, T>(&self, f: F) -> FiberResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(parking_lot::Mutex::new(None));
        let out = slot.clone();
        self.spawn(move || {
            *out.lock() = Some(f());
        })?
        .join()?;
        let value = slot.lock().take();
        value.ok_or(FiberError::NotFound)
    }

    /// Signal workers for fibers this thread queued with `NOSIGNAL`.
    pub fn flush(&self) {
        self.control.flush_remote_all();
    }

    /// Stop every worker and wait for them to exit. Fibers still queued
    /// run to completion first; fibers blocked forever are abandoned.
    pub fn shutdown(&self) -> FiberResult<()> {
        self.control.stop_and_join()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.control.is_stopped() {
            if let Err(e) = self.control.stop_and_join() {
                tracing::warn!(error = %e, "runtime shutdown on drop failed");
            }
        }
    }
}
