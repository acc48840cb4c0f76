//! Blocking primitives used from fibers and plain threads

use fiber::{
    Butex, ButexError, CountdownEvent, FiberBarrier, FiberCondvar, FiberConfig, FiberError,
    FiberMutex, FiberRwLock, Runtime,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime(workers: usize) -> Runtime {
    Runtime::new(FiberConfig::new().concurrency(workers)).unwrap()
}

#[test]
fn test_mutex_counts_exactly() {
    const FIBERS: usize = 8;
    const ROUNDS: usize = 1000;
    let rt = runtime(4);
    let counter = Arc::new(FiberMutex::new(0usize));

    let handles: Vec<_> = (0..FIBERS)
        .map(|_| {
            let counter = counter.clone();
            rt.spawn(move || {
                for i in 0..ROUNDS {
                    let mut guard = counter.lock();
                    *guard += 1;
                    if i % 64 == 0 {
                        // Hold the lock across a switch
                        fiber::yield_now();
                    }
                }
            })
            .unwrap()
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), FIBERS * ROUNDS);
}

#[test]
fn test_mutex_shared_with_threads() {
    let rt = runtime(2);
    let counter = Arc::new(FiberMutex::new(0u64));

    let fibers: Vec<_> = (0..4)
        .map(|_| {
            let counter = counter.clone();
            rt.spawn(move || {
                for _ in 0..500 {
                    *counter.lock() += 1;
                }
            })
            .unwrap()
        })
        .collect();
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    *counter.lock() += 1;
                }
            })
        })
        .collect();

    for f in fibers {
        f.join().unwrap();
    }
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(*counter.lock(), 3000);
}

#[test]
fn test_timed_lock_times_out_in_fiber() {
    let rt = runtime(2);
    let mutex = Arc::new(FiberMutex::new(()));
    let _held = mutex.lock();

    let m = mutex.clone();
    let result = rt
        .block_on(move || {
            let started = Instant::now();
            let r = m.timed_lock(Instant::now() + Duration::from_millis(30)).map(|_| ());
            (r, started.elapsed())
        })
        .unwrap();
    assert_eq!(result.0, Err(FiberError::TimedOut));
    assert!(result.1 >= Duration::from_millis(25));
}

#[test]
fn test_sleep_does_not_block_worker() {
    // One worker: a sleeping fiber must leave it free for others
    let rt = runtime(1);
    let progress = Arc::new(AtomicUsize::new(0));

    let sleeper = rt
        .spawn(|| {
            fiber::sleep(Duration::from_millis(100)).unwrap();
        })
        .unwrap();
    let p = progress.clone();
    let worker = rt
        .spawn(move || {
            for _ in 0..10 {
                p.fetch_add(1, Ordering::SeqCst);
                fiber::yield_now();
            }
        })
        .unwrap();
    worker.join().unwrap();
    assert_eq!(progress.load(Ordering::SeqCst), 10);
    sleeper.join().unwrap();
}

#[test]
fn test_sleep_lasts_at_least_duration() {
    let rt = runtime(2);
    let elapsed = rt
        .block_on(|| {
            let started = Instant::now();
            fiber::sleep(Duration::from_millis(40)).unwrap();
            started.elapsed()
        })
        .unwrap();
    assert!(elapsed >= Duration::from_millis(40));
}

#[test]
fn test_butex_thread_wakes_fiber() {
    let rt = runtime(2);
    let butex = Arc::new(Butex::new(0));
    let b = butex.clone();
    let handle = rt
        .spawn(move || {
            while b.value().load(Ordering::Acquire) == 0 {
                let _ = b.wait(0, None);
            }
        })
        .unwrap();

    thread::sleep(Duration::from_millis(20));
    butex.value().store(1, Ordering::Release);
    butex.wake_all();
    handle.join().unwrap();
}

#[test]
fn test_butex_wait_timeout_in_fiber() {
    let rt = runtime(1);
    let r = rt
        .block_on(|| {
            let butex = Butex::new(5);
            let wrong = butex.wait(6, None);
            let timed = butex.wait(5, Some(Instant::now() + Duration::from_millis(10)));
            (wrong, timed)
        })
        .unwrap();
    assert_eq!(r, (Err(ButexError::WouldBlock), Err(ButexError::TimedOut)));
}

#[test]
fn test_countdown_across_fibers_and_threads() {
    let rt = runtime(4);
    let event = Arc::new(CountdownEvent::new(20));
    for _ in 0..10 {
        let e = event.clone();
        rt.spawn(move || e.signal(1)).unwrap().detach();
    }
    let threads: Vec<_> = (0..10)
        .map(|_| {
            let e = event.clone();
            thread::spawn(move || e.signal(1))
        })
        .collect();
    event.wait();
    assert!(event.count() <= 0);
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn test_countdown_timed_wait_from_fiber() {
    let rt = runtime(2);
    let r = rt
        .block_on(|| {
            let event = CountdownEvent::new(1);
            event.timed_wait(Instant::now() + Duration::from_millis(10))
        })
        .unwrap();
    assert_eq!(r, Err(FiberError::TimedOut));
}

#[test]
fn test_many_waiters_all_released() {
    let rt = runtime(4);
    let butex = Arc::new(Butex::new(0));
    let released = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..64)
        .map(|_| {
            let (b, r) = (butex.clone(), released.clone());
            rt.spawn(move || {
                while b.value().load(Ordering::Acquire) == 0 {
                    let _ = b.wait(0, None);
                }
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    butex.value().store(1, Ordering::Release);
    butex.wake_all();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(released.load(Ordering::SeqCst), 64);
}

#[test]
fn test_condvar_hands_items_between_fibers() {
    const ITEMS: usize = 200;
    let rt = runtime(2);
    let shared = Arc::new((FiberMutex::new(Vec::<usize>::new()), FiberCondvar::new()));

    let s = shared.clone();
    let consumer = rt
        .spawn(move || {
            let (queue, cond) = &*s;
            let mut got = 0;
            while got < ITEMS {
                let mut q = cond.wait_while(queue.lock(), |q| q.is_empty());
                got += q.drain(..).count();
            }
        })
        .unwrap();

    let s = shared.clone();
    let producer = rt
        .spawn(move || {
            let (queue, cond) = &*s;
            for i in 0..ITEMS {
                queue.lock().push(i);
                cond.notify_one();
                if i % 16 == 0 {
                    fiber::yield_now();
                }
            }
        })
        .unwrap();

    producer.join().unwrap();
    consumer.join().unwrap();
    assert!(shared.0.lock().is_empty());
}

#[test]
fn test_condvar_timeout_in_fiber() {
    let rt = runtime(1);
    let timed_out = rt
        .block_on(|| {
            let lock = FiberMutex::new(());
            let cond = FiberCondvar::new();
            let (_guard, timed_out) =
                cond.wait_until(lock.lock(), Instant::now() + Duration::from_millis(20));
            timed_out
        })
        .unwrap();
    assert!(timed_out);
}

#[test]
fn test_rwlock_writers_exclude_readers_in_fibers() {
    let rt = runtime(4);
    let lock = Arc::new(FiberRwLock::new((0u64, 0u64)));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let lock = lock.clone();
            rt.spawn(move || {
                for _ in 0..200 {
                    if i % 4 == 0 {
                        let mut w = lock.write();
                        w.0 += 1;
                        fiber::yield_now();
                        w.1 += 1;
                    } else {
                        let r = lock.read();
                        // A writer never leaves the pair half-updated
                        assert_eq!(r.0, r.1);
                    }
                }
            })
            .unwrap()
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.read(), (400, 400));
}

#[test]
fn test_barrier_releases_more_fibers_than_workers() {
    const PARTIES: usize = 8;
    let rt = runtime(2);
    let barrier = Arc::new(FiberBarrier::new(PARTIES));
    let leaders = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..PARTIES)
        .map(|_| {
            let (barrier, leaders) = (barrier.clone(), leaders.clone());
            rt.spawn(move || {
                for _ in 0..5 {
                    if barrier.wait() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .unwrap()
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(leaders.load(Ordering::SeqCst), 5);
}
