//! Fiber and worker state types

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Slot is free or the fiber has been created but not yet queued
    Created = 0,

    /// Sitting in a run queue
    Ready = 1,

    /// Currently executing on a worker
    Running = 2,

    /// Suspended on a butex (join, countdown, mutex, sleep)
    Blocked = 3,

    /// Body returned, resources being reclaimed
    Finished = 4,
}

impl FiberState {
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Finished)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Blocked,
            4 => FiberState::Finished,
            _ => FiberState::Created,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Created => "created",
            FiberState::Ready => "ready",
            FiberState::Running => "running",
            FiberState::Blocked => "blocked",
            FiberState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// State of a task group (one worker thread).
///
/// ```text
///   Idle ──pop──► RunningFiber ──switch back──► Idle
///    │
///    └─queues empty─► Stealing ──nothing found─► Parked ──signal─► Idle
///
///   any ──lot stopped──► ShuttingDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    RunningFiber = 1,
    Stealing = 2,
    Parked = 3,
    ShuttingDown = 4,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            1 => WorkerState::RunningFiber,
            2 => WorkerState::Stealing,
            3 => WorkerState::Parked,
            4 => WorkerState::ShuttingDown,
            _ => WorkerState::Idle,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::RunningFiber => "running",
            WorkerState::Stealing => "stealing",
            WorkerState::Parked => "parked",
            WorkerState::ShuttingDown => "shutting-down",
        };
        f.write_str(s)
    }
}
