//! Fiber identifier type

use core::fmt;

/// Unique identifier for one fiber instance.
///
/// The high 32 bits hold the version of the control-block slot, the low
/// 32 bits hold the slot index. The slot's version is bumped when the fiber
/// exits, so every id handed out for a previous occupant of the slot becomes
/// stale. Versions are never 0, hence a valid id is never 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value, never returned for a live fiber
    pub const INVALID: FiberId = FiberId(0);

    /// Compose an id from a slot version and slot index
    #[inline]
    pub const fn new(version: u32, slot: u32) -> Self {
        FiberId(((version as u64) << 32) | slot as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        FiberId(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Slot index in the control-block table
    #[inline]
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }

    /// Version of the slot when this id was issued
    #[inline]
    pub const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "FiberId({}v{})", self.slot(), self.version())
        } else {
            write!(f, "FiberId(INVALID)")
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advance a slot version, skipping 0 so ids are never 0.
#[inline]
pub const fn next_version(version: u32) -> u32 {
    match version.wrapping_add(1) {
        0 => 1,
        v => v,
    }
}
