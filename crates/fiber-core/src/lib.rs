//! # fiber-core
//!
//! Core types for the fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching, parking and the scheduler itself live in
//! `fiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Versioned fiber identifier
//! - `state` - Fiber and worker state enums
//! - `attr` - Creation attributes (stack tier, launch policy, flags, tag)
//! - `key` - Fiber-local key tables and their pool
//! - `error` - Error types

pub mod id;
pub mod state;
pub mod attr;
pub mod key;
pub mod error;

// Re-exports for convenience
pub use id::FiberId;
pub use state::{FiberState, WorkerState};
pub use attr::{FiberAttr, FiberFlags, LaunchPolicy, StackTier};
pub use key::{key_create, key_delete, FiberKey, KeyDestructor, KeyTable, KeytablePool};
pub use error::{ButexError, FiberError, FiberResult, StackError};

/// Runtime-wide limits
pub mod constants {
    /// Control blocks per segment of the slot table
    pub const META_BLOCK_SIZE: usize = 1024;

    /// Segments in the slot table (caps live fibers at 4M)
    pub const META_MAX_BLOCKS: usize = 4096;

    /// Upper bound for worker threads across all tags
    pub const MAX_CONCURRENCY: usize = 1024;

    /// Parking lots per tag
    pub const PARKING_LOT_NUM: usize = 4;

    /// Upper bound on workers woken by a single ready fiber
    pub const MAX_SIGNAL_PER_READY: usize = 2;

    /// Rounds of fiber-local destructors run on exit
    pub const DESTRUCTOR_ITERATIONS: usize = 4;
}
