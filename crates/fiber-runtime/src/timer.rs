//! Timer thread
//!
//! One background thread runs callbacks at their deadlines. Butex waits
//! with a deadline register their timeout here, and exited task groups are
//! freed through it after the configured delay.
//!
//! Entries live in a min-heap keyed by deadline. Cancellation is lazy: the
//! callback is removed from the task map and its heap entry is skipped when
//! it surfaces.

use fiber_core::error::{FiberError, FiberResult};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Identifies a scheduled callback. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

type Callback = Box<dyn FnOnce() + Send>;

/// Min-heap entry: earliest deadline first, ties broken by id
struct HeapEntry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

struct TimerState {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<u64, Callback>,
    /// Callback currently executing on the timer thread
    running: Option<u64>,
    next_id: u64,
    stop: bool,
    fired: u64,
}

struct Shared {
    state: Mutex<TimerState>,
    /// New earliest deadline, or stop
    wakeup: Condvar,
    /// A callback finished running
    done: Condvar,
}

/// Outcome of `TimerThread::unschedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unschedule {
    /// Removed before it ran; it never will
    Removed,
    /// Already ran (or was running and has now finished)
    AlreadyRan,
}

/// Background thread running callbacks at deadlines
pub struct TimerThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Spawn a timer thread named `name`.
    pub fn start(name: &str) -> FiberResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::with_capacity(1024),
                tasks: HashMap::with_capacity(1024),
                running: None,
                next_id: 1,
                stop: false,
                fired: 0,
            }),
            wakeup: Condvar::new(),
            done: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(thread_shared))
            .map_err(|e| FiberError::Spawn(e.to_string()))?;

        tracing::debug!(name, "timer thread started");
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `f` on the timer thread once `deadline` has passed.
    ///
    /// Returns `Err(ShuttingDown)` if the thread was stopped.
    pub fn schedule<F>(&self, f: F, deadline: Instant) -> FiberResult<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.state.lock();
        if st.stop {
            return Err(FiberError::ShuttingDown);
        }
        let id = st.next_id;
        st.next_id += 1;
        st.tasks.insert(id, Box::new(f));
        st.heap.push(HeapEntry { deadline, id });

        let earliest = st.heap.peek().map(|e| e.id) == Some(id);
        drop(st);
        if earliest {
            self.shared.wakeup.notify_one();
        }
        Ok(TimerId(id))
    }

    /// Cancel a callback.
    ///
    /// If the callback is running right now this waits for it to return, so
    /// whatever it references may be freed once this call returns.
    pub fn unschedule(&self, id: TimerId) -> Unschedule {
        let mut st = self.shared.state.lock();
        if st.tasks.remove(&id.0).is_some() {
            return Unschedule::Removed;
        }
        while st.running == Some(id.0) {
            self.shared.done.wait(&mut st);
        }
        Unschedule::AlreadyRan
    }

    /// Callbacks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Callbacks run so far
    pub fn fired(&self) -> u64 {
        self.shared.state.lock().fired
    }

    /// Stop the thread and wait for it. Pending callbacks are dropped
    /// without running.
    pub fn stop_and_join(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.stop {
                return;
            }
            st.stop = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run(shared: Arc<Shared>) {
    let mut st = shared.state.lock();
    loop {
        if st.stop {
            break;
        }
        let now = Instant::now();
        let next = st.heap.peek().map(|e| e.deadline);
        match next {
            None => {
                shared.wakeup.wait(&mut st);
                continue;
            }
            Some(deadline) if deadline > now => {
                shared.wakeup.wait_until(&mut st, deadline);
                continue;
            }
            Some(_) => {}
        }

        let Some(entry) = st.heap.pop() else { continue };
        // Unscheduled entries have no task left
        let Some(task) = st.tasks.remove(&entry.id) else { continue };
        st.running = Some(entry.id);
        drop(st);

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(timer_id = entry.id, "timer callback panicked");
        }

        st = shared.state.lock();
        st.running = None;
        st.fired += 1;
        shared.done.notify_all();
    }

    let dropped = std::mem::take(&mut st.tasks);
    st.heap.clear();
    drop(st);
    tracing::debug!(dropped = dropped.len(), "timer thread exiting");
}

static GLOBAL_TIMER: OnceLock<TimerThread> = OnceLock::new();
static GLOBAL_TIMER_INIT: Mutex<()> = parking_lot::const_mutex(());

/// Process-wide timer thread, started on first use.
pub fn global_timer() -> FiberResult<&'static TimerThread> {
    if let Some(timer) = GLOBAL_TIMER.get() {
        return Ok(timer);
    }
    let _guard = GLOBAL_TIMER_INIT.lock();
    if let Some(timer) = GLOBAL_TIMER.get() {
        return Ok(timer);
    }
    let timer = TimerThread::start("fiber-timer")?;
    Ok(GLOBAL_TIMER.get_or_init(|| timer))
}
