//! Fiber control blocks and the slot table recycling them
//!
//! Control blocks are allocated in blocks of `META_BLOCK_SIZE` that are
//! never freed, so a `&'static FiberMeta` stays valid for the life of the
//! process. A slot is reused once its fiber exited; the version stored in
//! the block's version butex tells ids of different occupants apart.

use crate::arch::RawContext;
use crate::butex::{Butex, WaiterRef};
use crate::memory::Stack;
use crate::task_control::TaskControl;
use fiber_core::attr::FiberFlags;
use fiber_core::constants::{META_BLOCK_SIZE, META_MAX_BLOCKS};
use fiber_core::error::{FiberError, FiberResult};
use fiber_core::id::FiberId;
use fiber_core::key::{KeyTable, KeytablePool};
use fiber_core::state::FiberState;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// A stack together with the context suspended on it
pub(crate) struct ContextualStack {
    pub stack: Stack,
    pub context: RawContext,
}

pub(crate) type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Control block of one fiber.
///
/// Atomic and mutex fields may be touched from any thread. The
/// `UnsafeCell` fields belong to whoever owns the fiber at the moment: the
/// creator until the id is published to a run queue, then the worker
/// running (or releasing) it. Wakers read `control` only while the fiber
/// sits in a butex queue, when nobody writes it.
pub struct FiberMeta {
    slot: u32,
    /// Holds the slot version; joiners wait on it
    pub(crate) version_butex: Butex,
    /// Serialises the exit-time version bump against stop/interrupt
    pub(crate) version_lock: Mutex<()>,
    pub(crate) stop: AtomicBool,
    pub(crate) interrupted: AtomicBool,
    /// Butex wait in progress, for `interrupt`
    pub(crate) current_waiter: Mutex<Option<WaiterRef>>,
    id: AtomicU64,
    tag: AtomicUsize,
    flags: AtomicU32,
    state: AtomicU8,
    nswitch: AtomicU64,
    func: UnsafeCell<Option<FiberFn>>,
    stack: UnsafeCell<Option<ContextualStack>>,
    keytable: UnsafeCell<Option<Box<KeyTable>>>,
    keytable_pool: UnsafeCell<Option<Arc<KeytablePool>>>,
    control: UnsafeCell<Option<Arc<TaskControl>>>,
}

unsafe impl Send for FiberMeta {}
unsafe impl Sync for FiberMeta {}

impl FiberMeta {
    fn new(slot: u32) -> Self {
        Self {
            slot,
            version_butex: Butex::new(1),
            version_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            current_waiter: Mutex::new(None),
            id: AtomicU64::new(0),
            tag: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            state: AtomicU8::new(FiberState::Finished as u8),
            nswitch: AtomicU64::new(0),
            func: UnsafeCell::new(None),
            stack: UnsafeCell::new(None),
            keytable: UnsafeCell::new(None),
            keytable_pool: UnsafeCell::new(None),
            control: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Current version of the slot
    #[inline]
    pub fn version(&self) -> u32 {
        self.version_butex.value().load(Ordering::Acquire)
    }

    /// Id of the current (or last) occupant
    #[inline]
    pub fn id(&self) -> FiberId {
        FiberId::from_raw(self.id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn tag(&self) -> usize {
        self.tag.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flags(&self) -> FiberFlags {
        FiberFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn has_flag(&self, flag: FiberFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Times a worker switched into this fiber
    #[inline]
    pub fn nswitch(&self) -> u64 {
        self.nswitch.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn count_switch(&self) {
        self.nswitch.fetch_add(1, Ordering::Relaxed);
    }

    /// True while `id` names the current occupant
    #[inline]
    pub fn is_current(&self, id: FiberId) -> bool {
        id.slot() == self.slot && self.version() == id.version()
    }

    /// Fill a freshly allocated block.
    ///
    /// # Safety
    ///
    /// Caller owns the slot (just allocated, not yet published).
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn init(
        &self,
        id: FiberId,
        tag: usize,
        flags: FiberFlags,
        func: FiberFn,
        stack: ContextualStack,
        keytable_pool: Option<Arc<KeytablePool>>,
        control: Arc<TaskControl>,
    ) {
        self.id.store(id.as_u64(), Ordering::Release);
        self.tag.store(tag, Ordering::Relaxed);
        self.flags.store(flags.bits(), Ordering::Relaxed);
        self.nswitch.store(0, Ordering::Relaxed);
        *self.func.get() = Some(func);
        *self.stack.get() = Some(stack);
        *self.keytable_pool.get() = keytable_pool;
        *self.control.get() = Some(control);
        self.set_state(FiberState::Created);
    }

    /// # Safety
    ///
    /// Only the fiber itself calls this, once.
    pub(crate) unsafe fn take_func(&self) -> Option<FiberFn> {
        (*self.func.get()).take()
    }

    /// Where the suspended context is saved on switch-out.
    ///
    /// # Safety
    ///
    /// The stack must be installed (between `init` and `take_stack`).
    pub(crate) unsafe fn context_ptr(&self) -> *mut RawContext {
        match &mut *self.stack.get() {
            Some(cs) => ptr::addr_of_mut!(cs.context),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// See `context_ptr`. The fiber must not be running.
    pub(crate) unsafe fn context(&self) -> RawContext {
        match &*self.stack.get() {
            Some(cs) => cs.context,
            None => RawContext::null(),
        }
    }

    /// # Safety
    ///
    /// Caller owns the fiber and it will never run again.
    pub(crate) unsafe fn take_stack(&self) -> Option<ContextualStack> {
        (*self.stack.get()).take()
    }

    /// # Safety
    ///
    /// Called from the running fiber only.
    pub(crate) unsafe fn take_keytable(&self) -> Option<Box<KeyTable>> {
        (*self.keytable.get()).take()
    }

    /// # Safety
    ///
    /// Called from the running fiber only, with no reference from
    /// `keytable_mut` alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn keytable_mut(&self) -> &mut Option<Box<KeyTable>> {
        &mut *self.keytable.get()
    }

    /// # Safety
    ///
    /// Caller owns the fiber, or the fiber is parked in a butex queue.
    pub(crate) unsafe fn keytable_pool(&self) -> Option<Arc<KeytablePool>> {
        (*self.keytable_pool.get()).clone()
    }

    /// # Safety
    ///
    /// Same as `keytable_pool`.
    pub(crate) unsafe fn control(&self) -> Option<Arc<TaskControl>> {
        (*self.control.get()).clone()
    }

    /// Drop everything the finished occupant left behind, keeping the
    /// version. Returns the runtime it belonged to.
    ///
    /// # Safety
    ///
    /// Caller owns the fiber and its stack was already taken.
    pub(crate) unsafe fn reset(&self) -> Option<Arc<TaskControl>> {
        self.stop.store(false, Ordering::Relaxed);
        self.interrupted.store(false, Ordering::Relaxed);
        *self.current_waiter.lock() = None;
        *self.func.get() = None;
        *self.keytable.get() = None;
        *self.keytable_pool.get() = None;
        self.set_state(FiberState::Finished);
        (*self.control.get()).take()
    }
}

struct SlotAlloc {
    free: Vec<u32>,
    next_fresh: u32,
}

static BLOCKS: [AtomicPtr<FiberMeta>; META_MAX_BLOCKS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; META_MAX_BLOCKS];

static SLOTS: Mutex<SlotAlloc> = parking_lot::const_mutex(SlotAlloc {
    free: Vec::new(),
    next_fresh: 0,
});

static LIVE: AtomicUsize = AtomicUsize::new(0);

const MAX_SLOTS: usize = META_BLOCK_SIZE * META_MAX_BLOCKS;

/// Claim a control block. Recycled slots go first (LIFO).
pub(crate) fn alloc_meta() -> FiberResult<&'static FiberMeta> {
    let mut slots = SLOTS.lock();
    let slot = match slots.free.pop() {
        Some(slot) => slot,
        None => {
            let slot = slots.next_fresh as usize;
            if slot >= MAX_SLOTS {
                return Err(FiberError::ResourceExhausted("fiber slot table full"));
            }
            let block = slot / META_BLOCK_SIZE;
            if BLOCKS[block].load(Ordering::Acquire).is_null() {
                let metas: Vec<FiberMeta> = (0..META_BLOCK_SIZE)
                    .map(|i| FiberMeta::new((block * META_BLOCK_SIZE + i) as u32))
                    .collect();
                let leaked = Box::leak(metas.into_boxed_slice());
                BLOCKS[block].store(leaked.as_mut_ptr(), Ordering::Release);
                tracing::debug!(block, "fiber meta block allocated");
            }
            slots.next_fresh += 1;
            slot as u32
        }
    };
    drop(slots);
    LIVE.fetch_add(1, Ordering::Relaxed);
    address_meta(slot).ok_or(FiberError::ResourceExhausted("fiber slot table"))
}

/// Give a slot back. Its version must already have been bumped.
pub(crate) fn free_meta(meta: &'static FiberMeta) {
    SLOTS.lock().free.push(meta.slot);
    LIVE.fetch_sub(1, Ordering::Relaxed);
}

/// Control block at `slot`, if its block was ever allocated
#[inline]
pub fn address_meta(slot: u32) -> Option<&'static FiberMeta> {
    let slot = slot as usize;
    let block = BLOCKS.get(slot / META_BLOCK_SIZE)?.load(Ordering::Acquire);
    if block.is_null() {
        return None;
    }
    // Blocks are never freed and hold META_BLOCK_SIZE entries
    Some(unsafe { &*block.add(slot % META_BLOCK_SIZE) })
}

/// Control block of `id` whatever its version
#[inline]
pub fn meta_of(id: FiberId) -> Option<&'static FiberMeta> {
    if !id.is_valid() {
        return None;
    }
    address_meta(id.slot())
}

/// Slots currently claimed (created and not yet released)
pub fn live_fibers() -> usize {
    LIVE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiber_core::id::next_version;

    #[test]
    fn test_alloc_and_address() {
        let meta = alloc_meta().unwrap();
        let again = address_meta(meta.slot()).unwrap();
        assert!(ptr::eq(meta, again));
        assert!(meta.version() != 0);
        free_meta(meta);
    }

    #[test]
    fn test_version_survives_recycle() {
        let meta = alloc_meta().unwrap();
        let v = meta.version();
        let id = FiberId::new(v, meta.slot());
        assert!(meta.is_current(id));

        meta.version_butex
            .value()
            .store(next_version(v), Ordering::Release);
        assert!(!meta.is_current(id));
        free_meta(meta);

        // Whoever gets the slot next sees the bumped version
        let m2 = address_meta(id.slot()).unwrap();
        assert_eq!(m2.version(), next_version(v));
    }

    #[test]
    fn test_unknown_slot() {
        assert!(address_meta(u32::MAX).is_none());
        assert!(meta_of(FiberId::INVALID).is_none());
    }
}
