//! Error types for the fiber runtime

use thiserror::Error;

/// Result type for runtime operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors surfaced by the fiber API.
///
/// Only recoverable conditions live here. Misuse of a `Fiber` handle and
/// panics escaping a fiber body abort the process instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("stack allocation failed: {0}")]
    Stack(#[from] StackError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The id does not name a live fiber
    #[error("no such fiber")]
    NotFound,

    #[error("operation timed out")]
    TimedOut,

    #[error("wait interrupted")]
    Interrupted,

    /// The calling fiber was asked to stop
    #[error("fiber stopped")]
    Stopped,

    /// The word did not hold the expected value
    #[error("value changed before wait")]
    WouldBlock,

    #[error("runtime already initialized")]
    AlreadyInitialized,

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Stack pool failures. Carries the OS errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("mmap of {size} bytes failed (errno {errno})")]
    Map { size: usize, errno: i32 },

    #[error("mprotect of guard page failed (errno {errno})")]
    Protect { errno: i32 },
}

/// Outcome of an unsuccessful butex wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ButexError {
    #[error("butex value differs from expected")]
    WouldBlock,

    #[error("butex wait timed out")]
    TimedOut,

    #[error("butex wait interrupted")]
    Interrupted,
}

impl From<ButexError> for FiberError {
    fn from(e: ButexError) -> Self {
        match e {
            ButexError::WouldBlock => FiberError::WouldBlock,
            ButexError::TimedOut => FiberError::TimedOut,
            ButexError::Interrupted => FiberError::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_error_converts() {
        let e: FiberError = StackError::Map { size: 4096, errno: 12 }.into();
        assert!(matches!(e, FiberError::Stack(StackError::Map { size: 4096, .. })));
        assert_eq!(
            e.to_string(),
            "stack allocation failed: mmap of 4096 bytes failed (errno 12)"
        );
    }

    #[test]
    fn test_butex_error_converts() {
        assert_eq!(FiberError::from(ButexError::TimedOut), FiberError::TimedOut);
        assert_eq!(FiberError::from(ButexError::Interrupted), FiberError::Interrupted);
    }
}
