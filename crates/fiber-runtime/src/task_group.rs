//! Task group: the run loop of one worker thread
//!
//! Every fiber switch goes through the worker's main context. A fiber that
//! yields, blocks or exits stores a `RemainedAction` in its group and jumps
//! to main; main runs the action on its own stack once the fiber's context
//! is saved, then picks the next fiber:
//!
//! 1. the run-next slot (set by an urgent start)
//! 2. the local queue, then the group's remote queue
//! 3. stealing from the other groups of the same tag
//! 4. parking on the tag's parking lot

use crate::arch::{jump_context, RawContext};
use crate::butex::{self, WaiterRef};
use crate::memory;
use crate::meta::{self, ContextualStack, FiberMeta};
use crate::remote_queue::RemoteTaskQueue;
use crate::task_control::TaskControl;
use crate::tls;
use crossbeam_queue::ArrayQueue;
use fiber_core::attr::FiberFlags;
use fiber_core::constants::DESTRUCTOR_ITERATIONS;
use fiber_core::id::{next_version, FiberId};
use fiber_core::key::KeyTable;
use fiber_core::state::{FiberState, WorkerState};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Large primes, coprime with every possible group count
const STEAL_OFFSETS: [usize; 8] = [1031, 1033, 1039, 1049, 1051, 1061, 1063, 1069];

/// Work the main loop does right after a fiber switched out
pub(crate) enum RemainedAction {
    /// Re-queue a fiber that yielded
    ReadyToRun(FiberId),
    /// Re-queue the creator and run the new fiber next
    StartForeground { creator: FiberId, next: FiberId },
    /// Finish a butex wait now that the waiter's context is saved
    WaitForButex(WaiterRef),
    /// Return an exited fiber's stack and slot
    ReleaseLastContext(&'static FiberMeta),
}

/// Counters of one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    pub index: usize,
    pub tag: usize,
    /// Parking lot of the tag this worker sleeps in
    pub lot: usize,
    pub state: WorkerState,
    pub switches: u64,
    pub signals: u64,
    pub parks: u64,
    pub wakeups: u64,
    pub steals: u64,
    pub queued: usize,
    pub remote_queued: usize,
}

pub struct TaskGroup {
    control: Arc<TaskControl>,
    tag: usize,
    index: usize,
    lot_index: usize,
    rq: ArrayQueue<FiberId>,
    remote_rq: RemoteTaskQueue,
    remote_num_nosignal: AtomicUsize,
    state: AtomicU8,
    nswitch: AtomicU64,
    nsignals: AtomicU64,
    nparks: AtomicU64,
    nwakeups: AtomicU64,
    nsteals: AtomicU64,
    steal_offset: usize,

    // Touched only by the worker thread running this group
    main_ctx: UnsafeCell<RawContext>,
    cur_meta: Cell<Option<&'static FiberMeta>>,
    runnext: Cell<Option<FiberId>>,
    remained: Cell<Option<RemainedAction>>,
    num_nosignal: Cell<usize>,
    steal_seed: Cell<usize>,
}

// The Cell/UnsafeCell fields are owned by the worker thread; every other
// thread goes through the queues and atomics.
unsafe impl Send for TaskGroup {}
unsafe impl Sync for TaskGroup {}

impl TaskGroup {
    pub(crate) fn new(control: Arc<TaskControl>, tag: usize, index: usize, lot_index: usize) -> Self {
        let capacity = control.config().runqueue_capacity;
        let remote_capacity = control.config().remote_queue_capacity();
        let seed: usize = rand::random();
        Self {
            control,
            tag,
            index,
            lot_index,
            rq: ArrayQueue::new(capacity),
            remote_rq: RemoteTaskQueue::new(remote_capacity),
            remote_num_nosignal: AtomicUsize::new(0),
            state: AtomicU8::new(WorkerState::Idle as u8),
            nswitch: AtomicU64::new(0),
            nsignals: AtomicU64::new(0),
            nparks: AtomicU64::new(0),
            nwakeups: AtomicU64::new(0),
            nsteals: AtomicU64::new(0),
            steal_offset: STEAL_OFFSETS[seed % STEAL_OFFSETS.len()],
            main_ctx: UnsafeCell::new(RawContext::null()),
            cur_meta: Cell::new(None),
            runnext: Cell::new(None),
            remained: Cell::new(None),
            num_nosignal: Cell::new(0),
            steal_seed: Cell::new(seed),
        }
    }

    #[inline]
    pub fn control(&self) -> &Arc<TaskControl> {
        &self.control
    }

    #[inline]
    pub fn tag(&self) -> usize {
        self.tag
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub(crate) fn lot_index(&self) -> usize {
        self.lot_index
    }

    /// True if this group runs fibers of `tag` for `control`
    #[inline]
    pub(crate) fn serves(&self, control: &Arc<TaskControl>, tag: usize) -> bool {
        self.tag == tag && Arc::ptr_eq(&self.control, control)
    }

    #[inline]
    pub(crate) fn current_meta(&self) -> Option<&'static FiberMeta> {
        self.cur_meta.get()
    }

    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GroupStats {
        GroupStats {
            index: self.index,
            tag: self.tag,
            lot: self.lot_index(),
            state: self.state(),
            switches: self.nswitch.load(Ordering::Relaxed),
            signals: self.nsignals.load(Ordering::Relaxed),
            parks: self.nparks.load(Ordering::Relaxed),
            wakeups: self.nwakeups.load(Ordering::Relaxed),
            steals: self.nsteals.load(Ordering::Relaxed),
            queued: self.rq.len(),
            remote_queued: self.remote_rq.len(),
        }
    }

    pub(crate) fn set_remained(&self, action: RemainedAction) {
        let prev = self.remained.replace(Some(action));
        debug_assert!(prev.is_none(), "remained action overwritten");
    }

    /// Save the running fiber's context and resume the main loop.
    ///
    /// Returns when the fiber is scheduled again, possibly by another
    /// worker: the caller must not touch `self` afterwards.
    pub(crate) fn switch_to_main(&self, meta: &'static FiberMeta) {
        unsafe {
            let from = meta.context_ptr();
            let to = *self.main_ctx.get();
            jump_context(from, to, 0, false);
        }
    }

    /// Run loop of the worker thread. Returns once the runtime stops and
    /// no work is left for this group.
    pub(crate) fn run_main_task(&self) {
        tls::set_current_group(self);
        tracing::debug!(worker = self.index, tag = self.tag, "worker running");
        while let Some(id) = self.wait_task() {
            self.sched_to(id);
        }
        tls::clear_current_group();
        tracing::debug!(
            worker = self.index,
            switches = self.nswitch.load(Ordering::Relaxed),
            "worker leaving run loop"
        );
    }

    fn wait_task(&self) -> Option<FiberId> {
        loop {
            if let Some(id) = self.runnext.take() {
                return Some(id);
            }
            if let Some(id) = self.rq.pop() {
                return Some(id);
            }
            if let Some(id) = self.remote_rq.pop() {
                return Some(id);
            }

            self.set_state(WorkerState::Stealing);
            let rounds = self.control.yield_before_idle();
            for round in 0..=rounds {
                if let Some(id) = self.steal_task() {
                    return Some(id);
                }
                if round < rounds {
                    thread::yield_now();
                }
            }

            let lot = self.control.parking_lot(self.tag, self.lot_index());
            let st = lot.get_state();
            if st.stopped() {
                self.set_state(WorkerState::ShuttingDown);
                return None;
            }
            // Work signalled before the snapshot is found here
            if let Some(id) = self.steal_task() {
                return Some(id);
            }

            self.set_state(WorkerState::Parked);
            self.nparks.fetch_add(1, Ordering::Relaxed);
            lot.wait(st);
            self.nwakeups.fetch_add(1, Ordering::Relaxed);
            self.set_state(WorkerState::Idle);
        }
    }

    fn steal_task(&self) -> Option<FiberId> {
        let mut seed = self.steal_seed.get();
        let stolen = self.control.steal_task(self.tag, &mut seed, self.steal_offset);
        self.steal_seed.set(seed);
        if stolen.is_some() {
            self.nsteals.fetch_add(1, Ordering::Relaxed);
        }
        stolen
    }

    /// Pop for a thief: local queue first, then remote
    pub(crate) fn pop_for_steal(&self) -> Option<FiberId> {
        self.rq.pop().or_else(|| self.remote_rq.pop())
    }

    fn sched_to(&self, id: FiberId) {
        let Some(meta) = meta::meta_of(id).filter(|m| m.is_current(id)) else {
            tracing::warn!(fiber = %id, "stale fiber id in run queue");
            return;
        };
        self.cur_meta.set(Some(meta));
        meta.set_state(FiberState::Running);
        meta.count_switch();
        self.set_state(WorkerState::RunningFiber);
        self.nswitch.fetch_add(1, Ordering::Relaxed);
        if meta.has_flag(FiberFlags::LOG_CONTEXT_SWITCH) {
            tracing::debug!(fiber = %id, worker = self.index, nswitch = meta.nswitch(), "switch to fiber");
        }

        let preserve_fpu = meta.has_flag(FiberFlags::PRESERVE_FPU);
        unsafe {
            let to = meta.context();
            jump_context(
                self.main_ctx.get(),
                to,
                meta as *const FiberMeta as usize,
                preserve_fpu,
            );
        }

        self.cur_meta.set(None);
        self.set_state(WorkerState::Idle);
        if let Some(action) = self.remained.take() {
            self.run_remained(action);
        }
    }

    fn run_remained(&self, action: RemainedAction) {
        match action {
            RemainedAction::ReadyToRun(id) => self.ready_to_run(id, false),
            RemainedAction::StartForeground { creator, next } => {
                self.ready_to_run(creator, false);
                if let Some(prev) = self.runnext.replace(Some(next)) {
                    self.ready_to_run(prev, false);
                }
            }
            RemainedAction::WaitForButex(waiter) => butex::wait_for_butex(self, waiter),
            RemainedAction::ReleaseLastContext(meta) => self.release_last_context(meta),
        }
    }

    fn release_last_context(&self, meta: &'static FiberMeta) {
        let stack = unsafe { meta.take_stack() };
        // Drops the fiber's runtime reference
        drop(unsafe { meta.reset() });
        if let Some(ContextualStack { stack, .. }) = stack {
            memory::release(stack, self.control.stack_config());
        }
        meta::free_meta(meta);
    }

    /// Queue `id` on this group. Worker thread only.
    pub(crate) fn ready_to_run(&self, id: FiberId, nosignal: bool) {
        if let Some(meta) = meta::meta_of(id) {
            meta.set_state(FiberState::Ready);
        }
        let mut warned = false;
        let mut pending = id;
        while let Err(back) = self.rq.push(pending) {
            if self.remote_rq.push(back) {
                break;
            }
            if !warned {
                tracing::warn!(worker = self.index, "run queues full, waiting for thieves");
                warned = true;
            }
            self.control.signal_task(1, self.tag);
            thread::sleep(Duration::from_millis(1));
            pending = back;
        }

        if nosignal {
            self.num_nosignal.set(self.num_nosignal.get() + 1);
        } else {
            let additional = self.num_nosignal.replace(0);
            self.nsignals.fetch_add(1, Ordering::Relaxed);
            self.control.signal_task(1 + additional, self.tag);
        }
    }

    /// Queue `id` from any thread.
    pub(crate) fn ready_to_run_remote(&self, id: FiberId, nosignal: bool) {
        if let Some(meta) = meta::meta_of(id) {
            meta.set_state(FiberState::Ready);
        }
        let mut warned = false;
        while !self.remote_rq.push(id) {
            self.flush_nosignal_tasks_remote();
            if !warned {
                tracing::warn!(worker = self.index, "remote queue full, retrying");
                warned = true;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if nosignal {
            self.remote_num_nosignal.fetch_add(1, Ordering::Relaxed);
        } else {
            let additional = self.remote_num_nosignal.swap(0, Ordering::Relaxed);
            self.nsignals.fetch_add(1, Ordering::Relaxed);
            self.control.signal_task(1 + additional, self.tag);
        }
    }

    /// Signal for fibers queued with `NOSIGNAL`. Worker thread only.
    pub(crate) fn flush_nosignal_tasks(&self) {
        let n = self.num_nosignal.replace(0);
        if n > 0 {
            self.nsignals.fetch_add(1, Ordering::Relaxed);
            self.control.signal_task(n, self.tag);
        }
    }

    pub(crate) fn flush_nosignal_tasks_remote(&self) {
        let n = self.remote_num_nosignal.swap(0, Ordering::Relaxed);
        if n > 0 {
            self.nsignals.fetch_add(1, Ordering::Relaxed);
            self.control.signal_task(n, self.tag);
        }
    }

    /// Re-queue the running fiber and switch away.
    pub(crate) fn yield_current(&self, meta: &'static FiberMeta) {
        self.set_remained(RemainedAction::ReadyToRun(meta.id()));
        self.switch_to_main(meta);
    }

    /// Park the running fiber in the run queue and run `next` right away.
    pub(crate) fn start_foreground(&self, current: &'static FiberMeta, next: FiberId) {
        self.set_remained(RemainedAction::StartForeground {
            creator: current.id(),
            next,
        });
        self.switch_to_main(current);
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("index", &self.index)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

/// First code run on a fresh fiber stack. The transfer value is the
/// fiber's control block.
pub(crate) extern "C" fn fiber_entry(transfer: usize) -> ! {
    let meta = unsafe { &*(transfer as *const FiberMeta) };
    task_runner(meta)
}

fn task_runner(meta: &'static FiberMeta) -> ! {
    let id = meta.id();
    let log = meta.has_flag(FiberFlags::LOG_START_AND_FINISH);
    if log {
        tracing::info!(fiber = %id, tag = meta.tag(), "fiber started");
    }

    if let Some(func) = unsafe { meta.take_func() } {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(func)) {
            tracing::error!(fiber = %id, panic = panic_message(&*payload), "fiber panicked, aborting");
            std::process::abort();
        }
    }

    // Destructors may store new values, hence several rounds
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let Some(table) = (unsafe { meta.take_keytable() }) else {
            break;
        };
        return_keytable(meta, table);
    }
    if let Some(table) = unsafe { meta.take_keytable() } {
        tracing::warn!(fiber = %id, "fiber-local values still set after destructor rounds");
        drop(table);
    }

    {
        let _guard = meta.version_lock.lock();
        let version = meta.version();
        meta.version_butex
            .value()
            .store(next_version(version), Ordering::Release);
    }
    meta.version_butex.wake_all();
    meta.set_state(FiberState::Finished);
    if log {
        tracing::info!(fiber = %id, switches = meta.nswitch(), "fiber finished");
    }

    let Some(group) = tls::current_group() else {
        tracing::error!(fiber = %id, "fiber exited outside a worker");
        std::process::abort();
    };
    group.set_remained(RemainedAction::ReleaseLastContext(meta));
    group.switch_to_main(meta);
    // Released contexts are never resumed
    std::process::abort()
}

fn return_keytable(meta: &'static FiberMeta, table: Box<KeyTable>) {
    let pool = unsafe { meta.keytable_pool() }
        .or_else(|| unsafe { meta.control() }.map(|c| c.keytable_pool().clone()));
    match pool {
        Some(pool) => pool.return_keytable(table),
        None => drop(table),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
