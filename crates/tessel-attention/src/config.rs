//! Kernel configuration.

use serde::{Deserialize, Serialize};
use tessel_core::{Result, TesselError};

use crate::softmax::{DegeneratePolicy, Stabilization};

/// Default tile edge for the blocked and fused kernels.
pub const DEFAULT_BLOCK: usize = 8;

/// Default flash key-block (Bc) and query-block (Br) sizes.
pub const DEFAULT_KEY_BLOCK: usize = 32;
pub const DEFAULT_QUERY_BLOCK: usize = 32;

/// Configuration shared by every attention kernel.
///
/// Each kernel reads the fields that apply to it and ignores the rest, so one
/// config can drive all four for cross-checking. Missing fields take their
/// defaults when deserialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Tile edge for the blocked and fused matrix multiplies.
    pub block: usize,

    /// Flash key-block size (Bc).
    pub key_block: usize,

    /// Flash query-block size (Br).
    pub query_block: usize,

    /// Multiplier applied to every Q·Kᵗ score. 1.0 computes the unscaled
    /// softmax(Q·Kᵗ)·V; use `1/sqrt(d)` for the transformer convention.
    pub scale: f32,

    /// Per-row offset subtracted before exponentiating.
    pub stabilization: Stabilization,

    /// What to do with a softmax row that has no probability mass.
    pub on_degenerate: DegeneratePolicy,

    /// Fan independent units out over rayon. When false every unit runs on
    /// the calling thread, in index order.
    pub parallel: bool,

    /// Run on a dedicated pool of this many threads instead of the global
    /// rayon pool.
    pub num_threads: Option<usize>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            block: DEFAULT_BLOCK,
            key_block: DEFAULT_KEY_BLOCK,
            query_block: DEFAULT_QUERY_BLOCK,
            scale: 1.0,
            stabilization: Stabilization::None,
            on_degenerate: DegeneratePolicy::ZeroRow,
            parallel: true,
            num_threads: None,
        }
    }
}

impl AttentionConfig {
    /// Single-threaded config, matching the reference loop order exactly.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    pub fn with_block(mut self, block: usize) -> Self {
        self.block = block;
        self
    }

    /// Set the flash key-block (Bc) and query-block (Br) sizes.
    pub fn with_flash_blocks(mut self, key_block: usize, query_block: usize) -> Self {
        self.key_block = key_block;
        self.query_block = query_block;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_stabilization(mut self, stabilization: Stabilization) -> Self {
        self.stabilization = stabilization;
        self
    }

    pub fn with_degenerate_policy(mut self, policy: DegeneratePolicy) -> Self {
        self.on_degenerate = policy;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Reject block sizes of zero and unusable scales.
    ///
    /// Blocks larger than the sequence are fine: every loop clamps its
    /// extent with `min(block, remaining)`.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("block", self.block),
            ("key_block", self.key_block),
            ("query_block", self.query_block),
        ] {
            if value == 0 {
                return Err(TesselError::InvalidBlockSize { name, value });
            }
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(TesselError::InvalidScale(self.scale));
        }
        if self.num_threads == Some(0) {
            return Err(TesselError::ThreadPool("num_threads must be at least 1".into()));
        }
        Ok(())
    }
}
