//! Row-wise softmax with a configurable stabilisation offset.
//!
//! `softmax(x)_k = exp(x_k - c) / Σ_j exp(x_j - c)` for a per-row constant `c`.
//! Any `c` gives the same distribution in exact arithmetic; it only decides
//! which inputs overflow or underflow in f32.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tessel_core::{Result, TesselError};

/// Which per-row constant is subtracted before exponentiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stabilization {
    /// Subtract nothing. Overflows once a score passes ~88.7.
    #[default]
    None,
    /// Subtract the row minimum. Keeps the smallest term at exp(0) = 1, but
    /// does not bound the largest exponent, so it does not prevent overflow.
    RowMin,
    /// Subtract the row maximum. Every exponent is ≤ 0, so the sum lies in
    /// [1, N] and never overflows.
    RowMax,
}

impl Stabilization {
    /// Offset for one fully materialised row.
    pub fn row_offset(self, row: &[f32]) -> f32 {
        if row.is_empty() {
            return 0.0;
        }
        match self {
            Stabilization::None => 0.0,
            Stabilization::RowMin => row.iter().copied().fold(f32::INFINITY, f32::min),
            Stabilization::RowMax => row.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        }
    }

    /// Running offset before any key block has been seen.
    pub fn initial(self) -> f32 {
        match self {
            Stabilization::None => 0.0,
            Stabilization::RowMin => f32::INFINITY,
            Stabilization::RowMax => f32::NEG_INFINITY,
        }
    }

    /// Fold a new block of scores into a running offset.
    pub fn merge(self, running: f32, block: &[f32]) -> f32 {
        match self {
            Stabilization::None => 0.0,
            Stabilization::RowMin => block.iter().copied().fold(running, f32::min),
            Stabilization::RowMax => block.iter().copied().fold(running, f32::max),
        }
    }
}

/// Handling of a row whose exponentials sum to zero or overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// The row's probabilities, and so its output row, become zero.
    #[default]
    ZeroRow,
    /// Fail the call with `DegenerateNormalization`.
    Error,
}

/// Normalise `row` in place. Returns false, leaving the row zeroed, when the
/// normaliser is zero or not finite.
pub fn softmax_row(row: &mut [f32], stabilization: Stabilization) -> bool {
    let offset = stabilization.row_offset(row);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - offset).exp();
        sum += *v;
    }
    if !is_usable_normalizer(sum) {
        row.fill(0.0);
        return false;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
    true
}

/// Apply [`softmax_row`] to every `cols`-wide row of `data`.
///
/// Returns the indices of degenerate rows.
pub fn softmax_rows(data: &mut [f32], cols: usize, stabilization: Stabilization) -> Vec<usize> {
    if cols == 0 {
        return Vec::new();
    }
    data.chunks_mut(cols)
        .enumerate()
        .filter_map(|(i, row)| (!softmax_row(row, stabilization)).then_some(i))
        .collect()
}

pub(crate) fn is_usable_normalizer(sum: f32) -> bool {
    sum > 0.0 && sum.is_finite()
}

/// Per-call bookkeeping for degenerate rows, shared across parallel units.
pub(crate) struct DegenerateRows {
    policy: DegeneratePolicy,
    zeroed: AtomicUsize,
}

impl DegenerateRows {
    pub(crate) fn new(policy: DegeneratePolicy) -> Self {
        Self {
            policy,
            zeroed: AtomicUsize::new(0),
        }
    }

    /// Note a degenerate row; fails under [`DegeneratePolicy::Error`].
    pub(crate) fn record(&self, batch: usize, head: usize, row: usize) -> Result<()> {
        match self.policy {
            DegeneratePolicy::ZeroRow => {
                self.zeroed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("degenerate softmax row b={} h={} i={}", batch, head, row);
                Ok(())
            }
            DegeneratePolicy::Error => {
                Err(TesselError::DegenerateNormalization { batch, head, row })
            }
        }
    }

    pub(crate) fn report(&self, kernel: &str) {
        let zeroed = self.zeroed.load(Ordering::Relaxed);
        if zeroed > 0 {
            tracing::warn!("{}: zeroed {} softmax rows with no usable probability mass", kernel, zeroed);
        }
    }
}
