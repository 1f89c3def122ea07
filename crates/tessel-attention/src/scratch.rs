//! Per-worker scratch rows for the fused kernel.

use parking_lot::Mutex;

/// A fixed set of scratch rows, one per worker slot.
///
/// A unit running on rayon worker `t` uses slot `t % slots`. The pool is built
/// with at least as many slots as the executing pool has threads, so two
/// concurrently running units never land on the same slot. Each slot sits
/// behind its own mutex, which is therefore never contended; it only turns an
/// undersized pool into waiting instead of aliasing.
pub struct ScratchPool {
    slots: Vec<Mutex<Vec<f32>>>,
    row_len: usize,
}

impl ScratchPool {
    pub fn new(slots: usize, row_len: usize) -> Self {
        Self {
            slots: (0..slots.max(1)).map(|_| Mutex::new(vec![0.0; row_len])).collect(),
            row_len,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Slot used by the calling thread. Threads outside a rayon pool use slot 0.
    pub fn current_slot(&self) -> usize {
        rayon::current_thread_index().unwrap_or(0) % self.slots.len()
    }

    /// Run `f` with this thread's row, zero-filled.
    ///
    /// `f` must not spawn rayon work: a worker that steals another unit while
    /// holding its slot would block on itself.
    pub fn with_row<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        let mut row = self.slots[self.current_slot()].lock();
        row.fill(0.0);
        f(&mut row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_row_is_zeroed_between_uses() {
        let pool = ScratchPool::new(1, 4);
        pool.with_row(|row| row.fill(7.0));
        pool.with_row(|row| assert!(row.iter().all(|&v| v == 0.0)));
        assert_eq!(pool.row_len(), 4);
    }

    #[test]
    fn test_outside_rayon_uses_slot_zero() {
        let pool = ScratchPool::new(4, 1);
        assert_eq!(pool.current_slot(), 0);
    }

    #[test]
    fn test_concurrent_units_never_share_a_row() {
        let threads = 4;
        let rayon_pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
        let clash = AtomicBool::new(false);
        rayon_pool.install(|| {
            let scratch = ScratchPool::new(rayon::current_num_threads(), 64);
            assert!(scratch.slots() >= threads);
            (0..2_000usize).into_par_iter().for_each(|unit| {
                scratch.with_row(|row| {
                    let tag = unit as f32 + 1.0;
                    row.fill(tag);
                    for _ in 0..50 {
                        std::hint::spin_loop();
                    }
                    if row.iter().any(|&v| v != tag) {
                        clash.store(true, Ordering::Relaxed);
                    }
                });
            });
        });
        assert!(!clash.load(Ordering::Relaxed));
    }
}
