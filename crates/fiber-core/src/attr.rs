//! Fiber creation attributes

use crate::key::KeytablePool;
use core::fmt;
use std::sync::Arc;

/// Stack size class. Sizes come from the runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StackTier {
    /// Same size as a native thread stack
    Pthread = 0,
    Small = 1,
    #[default]
    Normal = 2,
    Large = 3,
}

impl StackTier {
    pub const ALL: [StackTier; 4] = [
        StackTier::Pthread,
        StackTier::Small,
        StackTier::Normal,
        StackTier::Large,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StackTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackTier::Pthread => "pthread",
            StackTier::Small => "small",
            StackTier::Normal => "normal",
            StackTier::Large => "large",
        };
        f.write_str(s)
    }
}

/// When a newly created fiber first runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPolicy {
    /// Switch to the new fiber right away; the creator is re-queued.
    /// Only possible when the creator is itself a fiber.
    Immediately,
    /// Enqueue the new fiber and return.
    #[default]
    Lazy,
}

bitflags::bitflags! {
    /// Behaviour flags attached to a fiber
    pub struct FiberFlags: u32 {
        /// Log at info level when the fiber starts and finishes
        const LOG_START_AND_FINISH = 1 << 0;
        /// Log every switch into the fiber at debug level
        const LOG_CONTEXT_SWITCH = 1 << 1;
        /// Queue without waking a worker; `flush()` delivers the signal later
        const NOSIGNAL = 1 << 2;
        /// Restore floating point control state when switching into the
        /// fiber: MXCSR and the x87 control word on x86_64, FPCR on aarch64
        const PRESERVE_FPU = 1 << 3;
    }
}

impl Default for FiberFlags {
    fn default() -> Self {
        FiberFlags::empty()
    }
}

/// Attributes for `start`.
///
/// ```ignore
/// let attr = FiberAttr::new()
///     .stack_tier(StackTier::Small)
///     .launch(LaunchPolicy::Immediately);
/// ```
#[derive(Clone, Default)]
pub struct FiberAttr {
    pub stack_tier: StackTier,
    pub launch: LaunchPolicy,
    pub flags: FiberFlags,
    /// Worker tag to run on; `None` means the creator's tag (or tag 0)
    pub tag: Option<usize>,
    /// Pool for fiber-local tables; `None` uses the runtime's pool
    pub keytable_pool: Option<Arc<KeytablePool>>,
}

impl FiberAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small stack, enqueued lazily
    pub fn small() -> Self {
        Self::new().stack_tier(StackTier::Small)
    }

    /// Normal stack, run immediately when created from a fiber
    pub fn urgent() -> Self {
        Self::new().launch(LaunchPolicy::Immediately)
    }

    pub fn stack_tier(mut self, tier: StackTier) -> Self {
        self.stack_tier = tier;
        self
    }

    pub fn launch(mut self, policy: LaunchPolicy) -> Self {
        self.launch = policy;
        self
    }

    pub fn flags(mut self, flags: FiberFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn tag(mut self, tag: usize) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn keytable_pool(mut self, pool: Arc<KeytablePool>) -> Self {
        self.keytable_pool = Some(pool);
        self
    }

    #[inline]
    pub fn has_flag(&self, flag: FiberFlags) -> bool {
        self.flags.contains(flag)
    }
}

impl fmt::Debug for FiberAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberAttr")
            .field("stack_tier", &self.stack_tier)
            .field("launch", &self.launch)
            .field("flags", &self.flags)
            .field("tag", &self.tag)
            .field("keytable_pool", &self.keytable_pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let attr = FiberAttr::new();
        assert_eq!(attr.stack_tier, StackTier::Normal);
        assert_eq!(attr.launch, LaunchPolicy::Lazy);
        assert!(attr.flags.is_empty());
        assert!(attr.tag.is_none());
    }

    #[test]
    fn test_flags() {
        let attr = FiberAttr::urgent()
            .flags(FiberFlags::NOSIGNAL)
            .flags(FiberFlags::PRESERVE_FPU);
        assert!(attr.has_flag(FiberFlags::NOSIGNAL));
        assert!(attr.has_flag(FiberFlags::PRESERVE_FPU));
        assert!(!attr.has_flag(FiberFlags::LOG_CONTEXT_SWITCH));
        assert_eq!(attr.launch, LaunchPolicy::Immediately);
    }

    #[test]
    fn test_flags_survive_raw_bits() {
        let flags = FiberFlags::NOSIGNAL | FiberFlags::LOG_CONTEXT_SWITCH;
        let back = FiberFlags::from_bits_truncate(flags.bits() | 1 << 31);
        assert_eq!(back, flags);
        assert!(!back.contains(FiberFlags::PRESERVE_FPU));
    }

    #[test]
    fn test_tier_index() {
        for (i, tier) in StackTier::ALL.iter().enumerate() {
            assert_eq!(tier.index(), i);
        }
    }
}
