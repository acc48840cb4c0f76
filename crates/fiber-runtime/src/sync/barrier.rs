//! Barrier releasing a fixed number of fibers or threads together

use crate::butex::Butex;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;

struct Round {
    arrived: usize,
    generation: u32,
}

/// Blocks each caller of `wait` until `count` callers have arrived, then
/// releases them all and starts the next round.
///
/// The butex holds the round's generation; arrivals sleep until it moves.
pub struct FiberBarrier {
    count: usize,
    round: Mutex<Round>,
    generation: Butex,
}

impl FiberBarrier {
    /// A barrier for `count` parties. 0 behaves like 1.
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
            round: Mutex::new(Round { arrived: 0, generation: 0 }),
            generation: Butex::new(0),
        }
    }

    /// Wait for the rest of the round. Returns true in exactly one caller
    /// per round, the one whose arrival completed it.
    pub fn wait(&self) -> bool {
        let mut round = self.round.lock();
        let generation = round.generation;
        round.arrived += 1;
        if round.arrived == self.count {
            round.arrived = 0;
            round.generation = generation.wrapping_add(1);
            self.generation
                .value()
                .store(round.generation, Ordering::Release);
            drop(round);
            self.generation.wake_all();
            return true;
        }
        drop(round);

        while self.generation.value().load(Ordering::Acquire) == generation {
            // Interrupted or spurious: the generation check decides
            let _ = self.generation.wait(generation, None);
        }
        false
    }

    /// Parties per round
    pub fn count(&self) -> usize {
        self.count
    }
}

impl std::fmt::Debug for FiberBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let round = self.round.lock();
        f.debug_struct("FiberBarrier")
            .field("count", &self.count)
            .field("arrived", &round.arrived)
            .field("generation", &round.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_party_never_blocks() {
        let barrier = FiberBarrier::new(0);
        assert_eq!(barrier.count(), 1);
        assert!(barrier.wait());
        assert!(barrier.wait());
    }

    #[test]
    fn test_one_leader_per_round() {
        let barrier = Arc::new(FiberBarrier::new(4));
        let leaders = Arc::new(AtomicUsize::new(0));
        let before = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (barrier, leaders, before) = (barrier.clone(), leaders.clone(), before.clone());
                thread::spawn(move || {
                    for round in 1..=3 {
                        before.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        // Nobody passes before everyone of this round arrived
                        assert!(before.load(Ordering::SeqCst) >= 4 * round);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 3);
    }
}
