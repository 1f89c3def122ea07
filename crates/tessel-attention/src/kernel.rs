//! Shared kernel plumbing: declared dimensions, input validation and the
//! `AttentionKernel` trait implemented by every algorithm.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessel_core::{Result, StridedView, Tensor, TesselError};

use crate::blocked::BlockedAttention;
use crate::config::AttentionConfig;
use crate::flash::FlashAttention;
use crate::fused::FusedAttention;
use crate::naive::NaiveAttention;

/// Declared (B, H, N, d) extents of Q, K, V and O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttnDims {
    pub batch: usize,
    pub heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
}

impl AttnDims {
    pub fn new(batch: usize, heads: usize, seq_len: usize, head_dim: usize) -> Self {
        Self { batch, heads, seq_len, head_dim }
    }

    /// Read the dimensions off a rank-4 query tensor.
    pub fn from_query(q: &Tensor) -> Result<Self> {
        match *q.dims() {
            [b, h, n, d] => Ok(Self::new(b, h, n, d)),
            _ => Err(TesselError::ShapeMismatch {
                expected: vec![0; 4],
                got: q.dims().to_vec(),
            }),
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.batch, self.heads, self.seq_len, self.head_dim]
    }

    pub fn numel(&self) -> usize {
        self.batch * self.heads * self.seq_len * self.head_dim
    }

    /// Elements in one (b, h) slab: N·d.
    pub fn head_len(&self) -> usize {
        self.seq_len * self.head_dim
    }

    /// Number of (b, h) pairs.
    pub fn num_heads_total(&self) -> usize {
        self.batch * self.heads
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// (b, h) of the `unit`-th head slab.
    pub fn head_of(&self, unit: usize) -> (usize, usize) {
        (unit / self.heads, unit % self.heads)
    }

    /// (b, h, i) of the `unit`-th output row.
    pub fn row_of(&self, unit: usize) -> (usize, usize, usize) {
        let (b, h) = self.head_of(unit / self.seq_len);
        (b, h, unit % self.seq_len)
    }

    /// Fail with `ShapeMismatch` unless `t` has exactly these dimensions.
    pub fn check(&self, t: &Tensor) -> Result<()> {
        if t.dims() != self.shape() {
            return Err(TesselError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: t.dims().to_vec(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for AttnDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B={} H={} N={} d={}", self.batch, self.heads, self.seq_len, self.head_dim)
    }
}

/// Validated, contiguous Q/K/V for one call.
pub(crate) struct Inputs {
    q: Tensor,
    k: Tensor,
    v: Tensor,
}

impl Inputs {
    pub(crate) fn prepare(q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Self> {
        dims.check(q)?;
        dims.check(k)?;
        dims.check(v)?;
        Ok(Self {
            q: q.contiguous(),
            k: k.contiguous(),
            v: v.contiguous(),
        })
    }

    pub(crate) fn views(&self) -> Result<(StridedView<'_>, StridedView<'_>, StridedView<'_>)> {
        Ok((self.q.view()?, self.k.view()?, self.v.view()?))
    }
}

/// The N×d matrix of head (b, h) inside a (B, H, N, d) view.
pub(crate) fn head_matrix<'a>(
    t: &StridedView<'a>,
    dims: AttnDims,
    b: usize,
    h: usize,
) -> Result<StridedView<'a>> {
    StridedView::matrix(t.slice_at(&[b, h])?, dims.seq_len, dims.head_dim)
}

/// `acc + Σ a[j]·b[j]`, accumulated left to right.
#[inline]
pub(crate) fn dot_from(acc: f32, a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(acc, |acc, (x, y)| acc + x * y)
}

/// One algorithm computing O = softmax(scale · Q·Kᵗ)·V.
pub trait AttentionKernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &AttentionConfig;

    /// Compute attention for (B, H, N, d) inputs. Returns a new (B, H, N, d)
    /// tensor and never modifies the inputs.
    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Tensor>;
}

/// The four interchangeable algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    Naive,
    Blocked,
    Fused,
    Flash,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::Naive,
        KernelKind::Blocked,
        KernelKind::Fused,
        KernelKind::Flash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelKind::Naive => "naive",
            KernelKind::Blocked => "blocked",
            KernelKind::Fused => "fused",
            KernelKind::Flash => "flash",
        }
    }

    pub fn build(self, config: AttentionConfig) -> Result<Box<dyn AttentionKernel>> {
        Ok(match self {
            KernelKind::Naive => Box::new(NaiveAttention::new(config)?),
            KernelKind::Blocked => Box::new(BlockedAttention::new(config)?),
            KernelKind::Fused => Box::new(FusedAttention::new(config)?),
            KernelKind::Flash => Box::new(FlashAttention::new(config)?),
        })
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for KernelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KernelKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown kernel '{s}' (expected naive, blocked, fused or flash)"))
    }
}

/// Build every kernel from one config.
pub fn all_kernels(config: &AttentionConfig) -> Result<Vec<Box<dyn AttentionKernel>>> {
    KernelKind::ALL.into_iter().map(|k| k.build(config.clone())).collect()
}

/// Build one kernel by name. Returns `None` for an unknown name.
pub fn kernel_by_name(name: &str, config: &AttentionConfig) -> Option<Result<Box<dyn AttentionKernel>>> {
    name.parse::<KernelKind>().ok().map(|k| k.build(config.clone()))
}
