//! Fiber-aware synchronization primitives built on `Butex`
//!
//! All of them work from fibers (the worker runs other fibers meanwhile)
//! and from plain OS threads (which block on a futex).

mod barrier;
mod condvar;
mod countdown;
mod mutex;
mod rwlock;

pub use barrier::FiberBarrier;
pub use condvar::FiberCondvar;
pub use countdown::CountdownEvent;
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use rwlock::{FiberRwLock, FiberRwLockReadGuard, FiberRwLockWriteGuard};
