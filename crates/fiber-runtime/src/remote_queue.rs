//! Remote task queue
//!
//! Bounded FIFO ring that lets threads outside a task group hand it ready
//! fibers. A single mutex guards the ring; this path is only taken by
//! non-worker producers (and timer callbacks), never by the worker's own
//! hot loop.

use fiber_core::id::FiberId;
use parking_lot::Mutex;

struct Ring {
    buf: Box<[FiberId]>,
    head: usize,
    len: usize,
}

pub struct RemoteTaskQueue {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl RemoteTaskQueue {
    /// Queue holding at most `capacity` ids. Capacity never changes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                buf: vec![FiberId::INVALID; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
            }),
            capacity,
        }
    }

    /// Append `id`. Returns false, leaving the queue untouched, when full.
    pub fn push(&self, id: FiberId) -> bool {
        let mut ring = self.ring.lock();
        if ring.len == self.capacity {
            return false;
        }
        let tail = (ring.head + ring.len) % self.capacity;
        ring.buf[tail] = id;
        ring.len += 1;
        true
    }

    /// Take the oldest id without blocking.
    pub fn pop(&self) -> Option<FiberId> {
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }
        let id = ring.buf[ring.head];
        ring.head = (ring.head + 1) % self.capacity;
        ring.len -= 1;
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id(n: u32) -> FiberId {
        FiberId::new(1, n)
    }

    #[test]
    fn test_push_until_full_then_fifo() {
        const C: u32 = 16;
        let q = RemoteTaskQueue::new(C as usize);
        for i in 0..C {
            assert!(q.push(id(i)));
        }
        assert!(!q.push(id(99)));
        assert_eq!(q.len(), C as usize);

        for i in 0..C {
            assert_eq!(q.pop(), Some(id(i)));
        }
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let q = RemoteTaskQueue::new(3);
        for round in 0..10u32 {
            assert!(q.push(id(round * 2)));
            assert!(q.push(id(round * 2 + 1)));
            assert_eq!(q.pop(), Some(id(round * 2)));
            assert_eq!(q.pop(), Some(id(round * 2 + 1)));
        }
        assert_eq!(q.capacity(), 3);
    }

    #[test]
    fn test_concurrent_producers() {
        let q = Arc::new(RemoteTaskQueue::new(4000));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        assert!(q.push(id(t * 1000 + i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(!q.push(id(0)));

        // Per-producer order is preserved
        let mut last = [None::<u32>; 4];
        while let Some(v) = q.pop() {
            let t = (v.slot() / 1000) as usize;
            if let Some(prev) = last[t] {
                assert!(v.slot() > prev);
            }
            last[t] = Some(v.slot());
        }
    }
}
