//! Stack pool
//!
//! Fiber stacks are mmap'd with a guard region and cached per thread, one
//! bounded list per `StackTier`. Creation and destruction of fibers hit
//! only the cache of the thread doing the work; when a tier's cache is
//! full the released stack is unmapped.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("fiber-runtime requires a unix platform");
    }
}

use fiber_core::attr::StackTier;
use fiber_core::error::StackError;
use std::cell::RefCell;

/// Sizes and cache limits for each tier, indexed by `StackTier::index()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub sizes: [usize; 4],
    pub guard_size: usize,
    pub max_cached: [usize; 4],
}

impl StackConfig {
    #[inline]
    pub fn size_of(&self, tier: StackTier) -> usize {
        self.sizes[tier.index()]
    }

    #[inline]
    pub fn max_cached(&self, tier: StackTier) -> usize {
        self.max_cached[tier.index()]
    }

    /// Page-rounded (usable size, guard size) a fresh stack of `tier` would get
    fn mapped_shape(&self, tier: StackTier) -> (usize, usize) {
        let page = page_size();
        (
            round_to_page(self.size_of(tier).max(page), page),
            round_to_page(self.guard_size, page),
        )
    }
}

#[derive(Default)]
struct StackCache {
    tiers: [Vec<Stack>; 4],
}

thread_local! {
    static STACK_CACHE: RefCell<StackCache> = RefCell::new(StackCache::default());
}

/// Get a stack of `tier`, from this thread's cache when possible.
///
/// Never blocks. Mapping failures are returned to the caller.
pub fn acquire(tier: StackTier, config: &StackConfig) -> Result<Stack, StackError> {
    let (size, guard) = config.mapped_shape(tier);
    let cached = STACK_CACHE
        .try_with(|cache| cache.borrow_mut().tiers[tier.index()].pop())
        .ok()
        .flatten();

    match cached {
        Some(stack) if stack.size() == size && stack.guard_size() == guard => Ok(stack),
        // Cached under a different configuration; unmapped on drop
        _ => Stack::allocate(size, guard, tier),
    }
}

/// Give a stack back to this thread's cache, or unmap it if the tier is full.
pub fn release(stack: Stack, config: &StackConfig) {
    let tier = stack.tier();
    let max = config.max_cached(tier);
    let overflow = STACK_CACHE.try_with(move |cache| {
        let mut cache = cache.borrow_mut();
        let list = &mut cache.tiers[tier.index()];
        if list.len() < max {
            list.push(stack);
            None
        } else {
            Some(stack)
        }
    });
    // Drop outside the borrow
    drop(overflow);
}

/// Number of stacks of `tier` cached by the calling thread
pub fn cached_count(tier: StackTier) -> usize {
    STACK_CACHE
        .try_with(|cache| cache.borrow().tiers[tier.index()].len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StackConfig {
        StackConfig {
            sizes: [256 * 1024, 32 * 1024, 128 * 1024, 512 * 1024],
            guard_size: 4096,
            max_cached: [1, 2, 2, 1],
        }
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let cfg = config();
        let stack = acquire(StackTier::Normal, &cfg).unwrap();
        let addr = stack.bottom();
        assert!(stack.size() >= 128 * 1024);
        release(stack, &cfg);
        assert_eq!(cached_count(StackTier::Normal), 1);

        let again = acquire(StackTier::Normal, &cfg).unwrap();
        assert_eq!(again.bottom(), addr);
        assert_eq!(cached_count(StackTier::Normal), 0);
        release(again, &cfg);
    }

    #[test]
    fn test_cache_is_bounded() {
        let cfg = config();
        let stacks: Vec<_> = (0..4)
            .map(|_| acquire(StackTier::Small, &cfg).unwrap())
            .collect();
        for s in stacks {
            release(s, &cfg);
        }
        assert_eq!(cached_count(StackTier::Small), cfg.max_cached(StackTier::Small));
    }

    #[test]
    fn test_stack_is_writable_to_the_top() {
        let cfg = config();
        let stack = acquire(StackTier::Small, &cfg).unwrap();
        assert_eq!(stack.guard_size(), page_size().max(4096));
        unsafe {
            *stack.bottom() = 0xAB;
            *stack.top().sub(1) = 0xCD;
            assert_eq!(*stack.bottom(), 0xAB);
        }
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
        release(stack, &cfg);
    }

    /// Permissions column of the `/proc/self/maps` line covering `addr`
    #[cfg(target_os = "linux")]
    fn mapping_perms(addr: usize) -> Option<String> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        maps.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let (lo, hi) = fields.next()?.split_once('-')?;
            let lo = usize::from_str_radix(lo, 16).ok()?;
            let hi = usize::from_str_radix(hi, 16).ok()?;
            (lo <= addr && addr < hi).then(|| fields.next().map(str::to_owned))?
        })
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_guard_region_is_prot_none() {
        let cfg = config();
        let stack = acquire(StackTier::Small, &cfg).unwrap();
        let guard_lo = stack.bottom() as usize - stack.guard_size();
        let guard_hi = stack.bottom() as usize - 1;

        assert_eq!(mapping_perms(guard_lo).as_deref(), Some("---p"));
        assert_eq!(mapping_perms(guard_hi).as_deref(), Some("---p"));
        assert_eq!(mapping_perms(stack.bottom() as usize).as_deref(), Some("rw-p"));
        release(stack, &cfg);
    }

    #[test]
    fn test_unmappable_size_is_an_error() {
        let err = Stack::allocate(1 << 52, 4096, StackTier::Large).unwrap_err();
        assert!(matches!(err, StackError::Map { .. }), "{err:?}");
    }

    #[test]
    fn test_size_change_bypasses_cache() {
        let cfg = config();
        let stack = acquire(StackTier::Large, &cfg).unwrap();
        release(stack, &cfg);

        let mut bigger = cfg;
        bigger.sizes[StackTier::Large.index()] = 1024 * 1024;
        let stack = acquire(StackTier::Large, &bigger).unwrap();
        assert!(stack.size() >= 1024 * 1024);
        assert_eq!(cached_count(StackTier::Large), 0);
    }

    #[test]
    fn test_cache_is_per_thread() {
        let cfg = config();
        let stack = acquire(StackTier::Pthread, &cfg).unwrap();
        release(stack, &cfg);
        assert_eq!(cached_count(StackTier::Pthread), 1);
        let other = std::thread::spawn(|| cached_count(StackTier::Pthread))
            .join()
            .unwrap();
        assert_eq!(other, 0);
    }
}
