//! # fiber-runtime
//!
//! M:N fiber scheduler. Fibers are multiplexed onto worker threads
//! ("task groups"), each with a local run queue that other workers steal
//! from. Blocking primitives park the fiber, not the worker.
//!
//! This crate provides:
//! - Stack pool (mmap with guard pages, per-thread cache per size tier)
//! - Context switching (architecture-specific assembly)
//! - Worker parking lots (futex based)
//! - Task groups and the task control that owns them
//! - Butex, the futex-like word every blocking primitive is built on
//! - Timer thread for timed waits
//! - Fiber-local storage backed by pooled key tables

pub mod arch;
pub mod butex;
pub mod config;
pub mod fiber;
pub mod key;
pub mod memory;
pub mod meta;
pub mod parking;
pub mod remote_queue;
pub mod sync;
pub mod task_control;
pub mod task_group;
pub mod timer;
pub mod tls;

// Re-exports
pub use butex::Butex;
pub use config::{ConfigError, FiberConfig};
pub use fiber::{
    current_control, exists, flush, interrupt, join, self_id, self_tag, sleep, start,
    start_background, start_urgent, stop, stopped, yield_now, FiberList,
};
pub use key::{set_specific, take_specific, with_specific};
pub use memory::StackConfig;
pub use sync::{
    CountdownEvent, FiberBarrier, FiberCondvar, FiberMutex, FiberMutexGuard, FiberRwLock,
    FiberRwLockReadGuard, FiberRwLockWriteGuard,
};
pub use task_control::{init_global, task_control, TaskControl};
pub use task_group::GroupStats;
pub use timer::{global_timer, TimerId, TimerThread};
pub use tls::{in_fiber, is_worker_thread};

