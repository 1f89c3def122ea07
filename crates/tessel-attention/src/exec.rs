//! Parallel-for over disjoint output units.
//!
//! Kernels split O into non-overlapping mutable slices (a head slab, a query
//! block, a single row) and hand each slice to a closure together with its
//! unit index. Q, K and V are only ever borrowed immutably, so no locking is
//! needed: disjointness of the output slices is enforced by the borrow checker.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tessel_core::{Result, TesselError};

use crate::config::AttentionConfig;

/// Runs kernel units either on rayon or sequentially on the calling thread.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: Option<Arc<ThreadPool>>,
    parallel: bool,
}

impl Executor {
    pub fn new(config: &AttentionConfig) -> Result<Self> {
        let pool = match config.num_threads {
            Some(n) if config.parallel => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("tessel-{i}"))
                    .build()
                    .map_err(|e| TesselError::ThreadPool(e.to_string()))?;
                tracing::debug!("built dedicated attention pool with {} threads", n);
                Some(Arc::new(pool))
            }
            _ => None,
        };
        Ok(Self {
            pool,
            parallel: config.parallel,
        })
    }

    pub fn sequential() -> Self {
        Self {
            pool: None,
            parallel: false,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Upper bound on the number of units that can execute at once.
    pub fn concurrency(&self) -> usize {
        if !self.parallel {
            return 1;
        }
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Run `op` inside this executor's pool.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        R: Send,
        OP: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Call `op(scratch, index, unit)` for every unit.
    ///
    /// `init` builds per-worker scratch; a scratch value is reused by the units
    /// one worker runs back to back and is never shared between workers. The
    /// first error stops the remaining units and is returned.
    pub fn run_units<S, I, F>(&self, units: Vec<&mut [f32]>, init: I, op: F) -> Result<()>
    where
        I: Fn() -> S + Send + Sync,
        F: Fn(&mut S, usize, &mut [f32]) -> Result<()> + Send + Sync,
    {
        if !self.parallel {
            let mut scratch = init();
            for (index, unit) in units.into_iter().enumerate() {
                op(&mut scratch, index, unit)?;
            }
            return Ok(());
        }
        self.install(|| {
            units
                .into_par_iter()
                .enumerate()
                .try_for_each_init(&init, |scratch, (index, unit)| op(scratch, index, unit))
        })
    }
}

/// Split `out` into `slab_len` slabs, then each slab into `unit_len` units.
///
/// The last unit of a slab is shorter when `unit_len` does not divide
/// `slab_len`; units never straddle two slabs.
pub(crate) fn split_units(out: &mut [f32], slab_len: usize, unit_len: usize) -> Vec<&mut [f32]> {
    let mut units = Vec::new();
    if slab_len == 0 || unit_len == 0 {
        return units;
    }
    for slab in out.chunks_mut(slab_len) {
        units.extend(slab.chunks_mut(unit_len));
    }
    units
}
