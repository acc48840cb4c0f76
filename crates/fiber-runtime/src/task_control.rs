//! Task control: the runtime object
//!
//! Owns every task group (one per worker thread), the parking lots of each
//! tag, the default keytable pool and the configuration. Workers are split
//! into tags; a fiber only ever runs on workers of its own tag.
//!
//! Concurrency can grow at runtime (eagerly, or lazily when signals find
//! no parked worker and `min_concurrency` is set) but never shrinks.

use crate::arch::make_context;
use crate::config::FiberConfig;
use crate::memory::{self, StackConfig};
use crate::meta::{self, ContextualStack};
use crate::parking::ParkingLot;
use crate::task_group::{fiber_entry, GroupStats, TaskGroup};
use crate::timer::global_timer;
use crate::tls;
use fiber_core::attr::{FiberAttr, FiberFlags, LaunchPolicy};
use fiber_core::constants::{MAX_CONCURRENCY, MAX_SIGNAL_PER_READY, PARKING_LOT_NUM};
use fiber_core::error::{FiberError, FiberResult};
use fiber_core::id::FiberId;
use fiber_core::key::KeytablePool;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Workers of one tag and the lots they park on
struct TagGroup {
    groups: RwLock<Vec<Arc<TaskGroup>>>,
    lots: [ParkingLot; PARKING_LOT_NUM],
    /// Workers started for this tag
    concurrency: AtomicUsize,
    /// Workers this tag may grow to
    target: AtomicUsize,
}

impl TagGroup {
    fn new(target: usize) -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            lots: [const { ParkingLot::new() }; PARKING_LOT_NUM],
            concurrency: AtomicUsize::new(0),
            target: AtomicUsize::new(target),
        }
    }
}

pub struct TaskControl {
    config: FiberConfig,
    stack_config: StackConfig,
    tags: Vec<TagGroup>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: AtomicUsize,
    stop: AtomicBool,
    yield_before_idle: AtomicU32,
    keytable_pool: Arc<KeytablePool>,
    /// Serialises worker creation
    add_worker_lock: Mutex<()>,
}

impl TaskControl {
    /// Validate `config` and start the initial workers.
    pub fn new(config: FiberConfig) -> FiberResult<Arc<Self>> {
        config.validate()?;
        config.log();

        let ntags = config.ntags;
        let tags = (0..ntags)
            .map(|tag| TagGroup::new(share_of(config.concurrency, ntags, tag)))
            .collect();
        let control = Arc::new(Self {
            stack_config: config.stack_config(),
            yield_before_idle: AtomicU32::new(config.yield_before_idle),
            tags,
            workers: Mutex::new(Vec::new()),
            concurrency: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            keytable_pool: Arc::new(KeytablePool::new()),
            add_worker_lock: Mutex::new(()),
            config,
        });

        let initial = control.config.initial_concurrency();
        {
            let _guard = control.add_worker_lock.lock();
            for tag in 0..ntags {
                for _ in 0..share_of(initial, ntags, tag) {
                    if let Err(e) = control.add_worker_locked(tag) {
                        drop(_guard);
                        control.stop_and_join()?;
                        return Err(e);
                    }
                }
            }
        }
        tracing::info!(workers = initial, ntags, "fiber runtime started");
        Ok(control)
    }

    #[inline]
    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    #[inline]
    pub fn stack_config(&self) -> &StackConfig {
        &self.stack_config
    }

    /// Default pool for fiber-local tables
    #[inline]
    pub fn keytable_pool(&self) -> &Arc<KeytablePool> {
        &self.keytable_pool
    }

    #[inline]
    pub fn ntags(&self) -> usize {
        self.tags.len()
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn parking_lot(&self, tag: usize, lot: usize) -> &ParkingLot {
        &self.tags[tag].lots[lot]
    }

    #[inline]
    pub fn yield_before_idle(&self) -> u32 {
        self.yield_before_idle.load(Ordering::Relaxed)
    }

    /// Steal rounds an idle worker makes before parking
    pub fn set_yield_before_idle(&self, n: u32) {
        self.yield_before_idle.store(n, Ordering::Relaxed);
    }

    /// Workers started across all tags
    pub fn get_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn get_concurrency_by_tag(&self, tag: usize) -> FiberResult<usize> {
        self.tag_group(tag).map(|tg| tg.concurrency.load(Ordering::Acquire))
    }

    fn target_concurrency(&self) -> usize {
        self.tags.iter().map(|tg| tg.target.load(Ordering::Relaxed)).sum()
    }

    fn tag_group(&self, tag: usize) -> FiberResult<&TagGroup> {
        self.tags.get(tag).ok_or(FiberError::InvalidArgument("no such tag"))
    }

    /// Raise the total number of workers to `n`. The extra workers go to
    /// the tags with the fewest. Lowering is refused.
    pub fn set_concurrency(self: &Arc<Self>, n: usize) -> FiberResult<()> {
        let _guard = self.add_worker_lock.lock();
        let current = self.target_concurrency();
        if n < current {
            return Err(FiberError::InvalidArgument("concurrency can only grow"));
        }
        if n > MAX_CONCURRENCY {
            return Err(FiberError::InvalidArgument("concurrency exceeds MAX_CONCURRENCY"));
        }
        for _ in current..n {
            let smallest = self
                .tags
                .iter()
                .min_by_key(|tg| tg.target.load(Ordering::Relaxed))
                .ok_or(FiberError::InvalidArgument("no tags"))?;
            smallest.target.fetch_add(1, Ordering::Relaxed);
        }
        if self.config.min_concurrency == 0 {
            for tag in 0..self.tags.len() {
                self.grow_tag_locked(tag)?;
            }
        }
        Ok(())
    }

    /// Raise the number of workers serving `tag` to `n`.
    pub fn set_concurrency_by_tag(self: &Arc<Self>, n: usize, tag: usize) -> FiberResult<()> {
        let _guard = self.add_worker_lock.lock();
        let tg = self.tag_group(tag)?;
        let current = tg.target.load(Ordering::Relaxed);
        if n < current {
            return Err(FiberError::InvalidArgument("concurrency can only grow"));
        }
        if self.target_concurrency() - current + n > MAX_CONCURRENCY {
            return Err(FiberError::InvalidArgument("concurrency exceeds MAX_CONCURRENCY"));
        }
        tg.target.store(n, Ordering::Relaxed);
        self.grow_tag_locked(tag)
    }

    fn grow_tag_locked(self: &Arc<Self>, tag: usize) -> FiberResult<()> {
        let tg = &self.tags[tag];
        while tg.concurrency.load(Ordering::Acquire) < tg.target.load(Ordering::Relaxed) {
            self.add_worker_locked(tag)?;
        }
        Ok(())
    }

    /// Start one worker for `tag`. `add_worker_lock` must be held.
    fn add_worker_locked(self: &Arc<Self>, tag: usize) -> FiberResult<()> {
        if self.is_stopped() {
            return Err(FiberError::ShuttingDown);
        }
        let index = self.concurrency.load(Ordering::Acquire);
        if index >= MAX_CONCURRENCY {
            return Err(FiberError::ResourceExhausted("worker threads"));
        }
        let tg = &self.tags[tag];
        let lot_index = tg.concurrency.load(Ordering::Acquire) % PARKING_LOT_NUM;
        let group = Arc::new(TaskGroup::new(self.clone(), tag, index, lot_index));

        // Registered first so signals and thieves see it right away
        tg.groups.write().push(group.clone());
        tg.concurrency.fetch_add(1, Ordering::AcqRel);
        self.concurrency.fetch_add(1, Ordering::AcqRel);

        let worker = group.clone();
        let spawned = thread::Builder::new()
            .name(format!("fiber-worker-{}", index))
            .spawn(move || worker_main(worker));
        match spawned {
            Ok(handle) => {
                self.workers.lock().push(handle);
                tracing::debug!(worker = index, tag, lot = lot_index, "worker added");
                Ok(())
            }
            Err(e) => {
                self.remove_group(&group);
                tracing::error!(worker = index, error = %e, "failed to spawn worker");
                Err(FiberError::Spawn(e.to_string()))
            }
        }
    }

    /// Unregister a worker that exited or never started.
    fn remove_group(&self, group: &Arc<TaskGroup>) {
        let tg = &self.tags[group.tag()];
        let mut groups = tg.groups.write();
        let before = groups.len();
        groups.retain(|g| !Arc::ptr_eq(g, group));
        if groups.len() < before {
            tg.concurrency.fetch_sub(1, Ordering::AcqRel);
            self.concurrency.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Wake up to `n` (at most `MAX_SIGNAL_PER_READY`) parked workers of
    /// `tag`, adding a worker when none was parked and the tag may grow.
    pub(crate) fn signal_task(self: &Arc<Self>, n: usize, tag: usize) {
        if n == 0 {
            return;
        }
        let Some(tg) = self.tags.get(tag) else { return };
        let mut remaining = n.min(MAX_SIGNAL_PER_READY);
        let mut lot = rand::thread_rng().gen_range(0..PARKING_LOT_NUM);
        for _ in 0..PARKING_LOT_NUM {
            if remaining == 0 {
                break;
            }
            remaining = remaining.saturating_sub(tg.lots[lot].signal(1));
            lot = (lot + 1) % PARKING_LOT_NUM;
        }

        if remaining > 0
            && self.config.min_concurrency > 0
            && tg.concurrency.load(Ordering::Acquire) < tg.target.load(Ordering::Relaxed)
        {
            let _guard = self.add_worker_lock.lock();
            if tg.concurrency.load(Ordering::Acquire) < tg.target.load(Ordering::Relaxed) {
                if let Err(e) = self.add_worker_locked(tag) {
                    tracing::debug!(tag, error = %e, "lazy worker not added");
                }
            }
        }
    }

    /// Take a fiber from some group of `tag`, starting at `seed` and
    /// striding by `offset`.
    pub(crate) fn steal_task(&self, tag: usize, seed: &mut usize, offset: usize) -> Option<FiberId> {
        let groups = self.tags.get(tag)?.groups.read();
        let n = groups.len();
        if n == 0 {
            return None;
        }
        let mut s = *seed;
        let mut stolen = None;
        for _ in 0..n {
            if let Some(id) = groups[s % n].pop_for_steal() {
                stolen = Some(id);
                break;
            }
            s = s.wrapping_add(offset);
        }
        *seed = s.wrapping_add(offset);
        stolen
    }

    /// A random group of `tag`
    pub(crate) fn choose_one_group(&self, tag: usize) -> Option<Arc<TaskGroup>> {
        let groups = self.tags.get(tag)?.groups.read();
        if groups.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..groups.len());
        Some(groups[i].clone())
    }

    /// Queue `id` on some group of `tag` from outside that group.
    pub(crate) fn ready_to_run_remote(&self, id: FiberId, tag: usize) {
        match self.choose_one_group(tag) {
            Some(group) => group.ready_to_run_remote(id, false),
            None => tracing::warn!(fiber = %id, tag, "no worker left to run fiber"),
        }
    }

    /// Create a fiber running `f` and schedule it per `attr`.
    ///
    /// With `LaunchPolicy::Immediately` from a fiber of the same tag, the
    /// caller is re-queued and the new fiber runs at once. Otherwise the
    /// fiber is queued: on the calling worker when it serves the tag, on a
    /// random group of the tag when not.
    pub fn start<F>(self: &Arc<Self>, attr: FiberAttr, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(FiberError::ShuttingDown);
        }
        let worker = tls::current_group().filter(|g| Arc::ptr_eq(g.control(), self));
        let tag = attr.tag.or(worker.map(|g| g.tag())).unwrap_or(0);
        if tag >= self.tags.len() {
            return Err(FiberError::InvalidArgument("no such tag"));
        }

        let meta = meta::alloc_meta()?;
        let stack = match memory::acquire(attr.stack_tier, &self.stack_config) {
            Ok(stack) => stack,
            Err(e) => {
                meta::free_meta(meta);
                tracing::warn!(error = %e, tier = %attr.stack_tier, "fiber stack allocation failed");
                return Err(e.into());
            }
        };
        let context = unsafe { make_context(stack.top(), stack.size(), fiber_entry) };
        let id = FiberId::new(meta.version(), meta.slot());
        unsafe {
            meta.init(
                id,
                tag,
                attr.flags,
                Box::new(f),
                ContextualStack { stack, context },
                attr.keytable_pool.clone(),
                self.clone(),
            );
        }

        let nosignal = attr.has_flag(FiberFlags::NOSIGNAL);
        match worker.filter(|g| g.tag() == tag) {
            Some(group) => match (attr.launch, group.current_meta()) {
                (LaunchPolicy::Immediately, Some(current)) => group.start_foreground(current, id),
                _ => group.ready_to_run(id, nosignal),
            },
            None => match self.choose_one_group(tag) {
                Some(group) => group.ready_to_run_remote(id, nosignal),
                None => {
                    // Never published; reclaim everything
                    unsafe {
                        if let Some(cs) = meta.take_stack() {
                            memory::release(cs.stack, &self.stack_config);
                        }
                        meta.reset();
                    }
                    meta::free_meta(meta);
                    return Err(FiberError::ShuttingDown);
                }
            },
        }
        Ok(id)
    }

    /// Signal for every fiber queued with `NOSIGNAL` from outside workers
    pub fn flush_remote_all(&self) {
        for tg in &self.tags {
            let groups: Vec<_> = tg.groups.read().iter().cloned().collect();
            for g in groups {
                g.flush_nosignal_tasks_remote();
            }
        }
    }

    /// Snapshot of every registered group
    pub fn group_stats(&self) -> Vec<GroupStats> {
        self.tags
            .iter()
            .flat_map(|tg| tg.groups.read().iter().map(|g| g.stats()).collect::<Vec<_>>())
            .collect()
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Queued fibers are drained first; fibers blocked forever are
    /// abandoned. Must not be called from a worker of this runtime.
    pub fn stop_and_join(&self) -> FiberResult<()> {
        if let Some(group) = tls::current_group() {
            if std::ptr::eq(Arc::as_ptr(group.control()), self) {
                return Err(FiberError::InvalidArgument(
                    "stop_and_join called from one of the runtime's workers",
                ));
            }
        }
        if self.stop.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for tg in &self.tags {
            for lot in &tg.lots {
                lot.stop();
            }
        }

        let handles = {
            let _guard = self.add_worker_lock.lock();
            std::mem::take(&mut *self.workers.lock())
        };
        let n = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        self.keytable_pool.destroy();
        tracing::info!(workers = n, "fiber runtime stopped");
        Ok(())
    }
}

impl Drop for TaskControl {
    fn drop(&mut self) {
        tracing::debug!("task control dropped");
    }
}

impl std::fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskControl")
            .field("concurrency", &self.get_concurrency())
            .field("ntags", &self.ntags())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Part of `total` given to `tag` when spread evenly over `ntags`
fn share_of(total: usize, ntags: usize, tag: usize) -> usize {
    total / ntags + usize::from(tag < total % ntags)
}

fn worker_main(group: Arc<TaskGroup>) {
    group.run_main_task();

    let control = group.control().clone();
    control.remove_group(&group);
    // Late wakers may still hold the group; free it after a grace period
    let delay = control.config().task_group_delete_delay;
    let index = group.index();
    let scheduled = global_timer().and_then(|timer| {
        let group = group.clone();
        timer.schedule(move || drop(group), Instant::now() + delay)
    });
    if let Err(e) = scheduled {
        tracing::debug!(worker = index, error = %e, "freeing task group now");
    }
    drop(group);
    tracing::debug!(worker = index, "worker exited");
}

static GLOBAL_CONTROL: OnceLock<Arc<TaskControl>> = OnceLock::new();
static GLOBAL_CONTROL_INIT: Mutex<()> = parking_lot::const_mutex(());

/// The process-wide runtime, created from `FiberConfig::from_env()` on
/// first use.
pub fn task_control() -> FiberResult<&'static Arc<TaskControl>> {
    if let Some(control) = GLOBAL_CONTROL.get() {
        return Ok(control);
    }
    let _guard = GLOBAL_CONTROL_INIT.lock();
    if let Some(control) = GLOBAL_CONTROL.get() {
        return Ok(control);
    }
    let control = TaskControl::new(FiberConfig::from_env())?;
    Ok(GLOBAL_CONTROL.get_or_init(|| control))
}

/// Create the process-wide runtime with `config`.
///
/// Fails with `AlreadyInitialized` once it exists, including after an
/// implicit creation by `task_control()`.
pub fn init_global(config: FiberConfig) -> FiberResult<&'static Arc<TaskControl>> {
    let _guard = GLOBAL_CONTROL_INIT.lock();
    if GLOBAL_CONTROL.get().is_some() {
        return Err(FiberError::AlreadyInitialized);
    }
    let control = TaskControl::new(config)?;
    Ok(GLOBAL_CONTROL.get_or_init(|| control))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_of() {
        assert_eq!(share_of(4, 1, 0), 4);
        assert_eq!(share_of(5, 2, 0), 3);
        assert_eq!(share_of(5, 2, 1), 2);
        assert_eq!((0..3).map(|t| share_of(7, 3, t)).sum::<usize>(), 7);
    }

    #[test]
    fn test_new_starts_workers_and_stops() {
        let control = TaskControl::new(FiberConfig::new().concurrency(3)).unwrap();
        assert_eq!(control.get_concurrency(), 3);
        assert_eq!(control.get_concurrency_by_tag(0).unwrap(), 3);
        assert!(control.get_concurrency_by_tag(1).is_err());
        control.stop_and_join().unwrap();
        assert!(control.is_stopped());
        assert_eq!(control.get_concurrency(), 0);
        assert_eq!(control.get_concurrency_by_tag(0).unwrap(), 0);
        assert!(control.group_stats().is_empty());
        // Second stop is a no-op
        control.stop_and_join().unwrap();
        assert_eq!(
            control.start(FiberAttr::new(), || {}),
            Err(FiberError::ShuttingDown)
        );
    }

    #[test]
    fn test_set_concurrency_only_grows() {
        let control = TaskControl::new(FiberConfig::new().concurrency(2)).unwrap();
        assert!(matches!(control.set_concurrency(1), Err(FiberError::InvalidArgument(_))));
        control.set_concurrency(4).unwrap();
        assert_eq!(control.get_concurrency(), 4);
        control.stop_and_join().unwrap();
    }

    #[test]
    fn test_lazy_workers_start_at_min() {
        let control = TaskControl::new(
            FiberConfig::new().concurrency(4).min_concurrency(1),
        )
        .unwrap();
        assert_eq!(control.get_concurrency(), 1);
        control.stop_and_join().unwrap();
    }

    #[test]
    fn test_tags_split_workers() {
        let control = TaskControl::new(FiberConfig::new().concurrency(3).ntags(2)).unwrap();
        assert_eq!(control.get_concurrency_by_tag(0).unwrap(), 2);
        assert_eq!(control.get_concurrency_by_tag(1).unwrap(), 1);
        control.set_concurrency_by_tag(3, 1).unwrap();
        assert_eq!(control.get_concurrency_by_tag(1).unwrap(), 3);
        assert!(control.set_concurrency_by_tag(1, 1).is_err());

        // Workers of a tag spread over its parking lots in start order
        let mut lots: Vec<usize> = control
            .group_stats()
            .iter()
            .filter(|s| s.tag == 1)
            .map(|s| s.lot)
            .collect();
        lots.sort_unstable();
        assert_eq!(lots, (0..3).map(|i| i % PARKING_LOT_NUM).collect::<Vec<_>>());
        control.stop_and_join().unwrap();
    }

    #[test]
    fn test_invalid_tag_rejected() {
        let control = TaskControl::new(FiberConfig::new().concurrency(1)).unwrap();
        let r = control.start(FiberAttr::new().tag(5), || {});
        assert!(matches!(r, Err(FiberError::InvalidArgument(_))));
        control.stop_and_join().unwrap();
    }
}
