//! Flash attention.
//!
//! Keys and values are streamed in blocks of Bc rows against query blocks of
//! Br rows. Each query row keeps a running normaliser `l`, a running offset
//! `m` and its output row, which always holds the softmax-weighted average
//! over the keys seen so far. A new key block with scores S is folded in as
//!
//! ```text
//! m'    = merge(m, S)                      (stays 0 without stabilisation)
//! c     = l · exp(m - m')                  (0 before the first block)
//! l'    = c + Σ_j exp(S_j - m')
//! O'    = (c · O + Σ_j exp(S_j - m') · V_j) / l'
//! ```
//!
//! so the N×N score matrix is never stored. Working memory per unit is one
//! Br×Bc block plus a few Br-length vectors.
//!
//! Query blocks are independent and run in parallel, one unit per
//! (b, h, query block). Key blocks of one query block depend on each other
//! through `l`, `m` and `O` and always run in order.

use tessel_core::{Result, StridedView, StridedViewMut, Tensor};

use crate::config::AttentionConfig;
use crate::exec::{split_units, Executor};
use crate::kernel::{dot_from, head_matrix, AttentionKernel, AttnDims, Inputs};
use crate::softmax::{is_usable_normalizer, DegenerateRows, Stabilization};

pub struct FlashAttention {
    config: AttentionConfig,
    exec: Executor,
}

/// Per-worker working set, reused by every unit a worker runs.
struct FlashScratch {
    /// Scores of the current block, exponentiated in place.
    sij: Vec<f32>,
    li: Vec<f32>,
    lij: Vec<f32>,
    lnew: Vec<f32>,
    mi: Vec<f32>,
    mnew: Vec<f32>,
}

impl FlashScratch {
    fn new(br: usize, bc: usize) -> Self {
        Self {
            sij: vec![0.0; br * bc],
            li: vec![0.0; br],
            lij: vec![0.0; br],
            lnew: vec![0.0; br],
            mi: vec![0.0; br],
            mnew: vec![0.0; br],
        }
    }
}

impl FlashAttention {
    pub fn new(config: AttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            exec: Executor::new(&config)?,
            config,
        })
    }

    /// Stream every key block of one head through the `bi` query rows in `oi`.
    ///
    /// `oi` arrives zeroed and leaves holding the exact output rows
    /// `ii..ii + bi`, or zeros for rows with no usable normaliser.
    #[allow(clippy::too_many_arguments)]
    fn query_block(
        &self,
        scratch: &mut FlashScratch,
        q: &StridedView<'_>,
        k: &StridedView<'_>,
        v: &StridedView<'_>,
        ii: usize,
        oi: &mut [f32],
        bc: usize,
        degenerate: &DegenerateRows,
        (b, h): (usize, usize),
    ) -> Result<()> {
        let (n, d) = (q.dims()[0], q.dims()[1]);
        let bi = oi.len() / d;
        let scale = self.config.scale;
        let stab = self.config.stabilization;
        let FlashScratch { sij, li, lij, lnew, mi, mnew } = scratch;

        let qi = StridedView::matrix(q.rows(ii, bi)?, bi, d)?;
        let mut oi = StridedViewMut::matrix(oi, bi, d)?;
        li[..bi].fill(0.0);
        mi[..bi].fill(stab.initial());

        for jj in (0..n).step_by(bc) {
            let bj = bc.min(n - jj);
            let kj = StridedView::matrix(k.rows(jj, bj)?, bj, d)?;
            let vj = StridedView::matrix(v.rows(jj, bj)?, bj, d)?;
            let mut pij = StridedViewMut::matrix(&mut sij[..bi * bj], bi, bj)?;

            for i in 0..bi {
                let q_row = qi.row(i)?;
                let p_row = pij.row_mut(i)?;
                for (j, s) in p_row.iter_mut().enumerate() {
                    *s = scale * dot_from(0.0, q_row, kj.row(j)?);
                }

                mnew[i] = stab.merge(mi[i], p_row);
                let mut sum = 0.0f32;
                for p in p_row.iter_mut() {
                    *p = (*p - mnew[i]).exp();
                    sum += *p;
                }
                lij[i] = sum;

                let carry = if li[i] > 0.0 {
                    li[i] * rescale(stab, mi[i], mnew[i])
                } else {
                    0.0
                };
                lnew[i] = carry + lij[i];

                let o_row = oi.row_mut(i)?;
                if !is_usable_normalizer(lnew[i]) {
                    o_row.fill(0.0);
                    continue;
                }
                // Fold 1/l' into the weights so a lone key reproduces V exactly.
                let keep = carry / lnew[i];
                p_row.iter_mut().for_each(|p| *p /= lnew[i]);
                for (col, o) in o_row.iter_mut().enumerate() {
                    let mut acc = keep * *o;
                    for j in 0..bj {
                        acc += p_row[j] * vj.get(&[j, col])?;
                    }
                    *o = acc;
                }
            }

            std::mem::swap(li, lnew);
            std::mem::swap(mi, mnew);
        }

        for i in 0..bi {
            if !is_usable_normalizer(li[i]) {
                oi.row_mut(i)?.fill(0.0);
                degenerate.record(b, h, ii + i)?;
            }
        }
        Ok(())
    }
}

/// exp(m_old - m_new), exactly 1 when no offset is tracked.
#[inline]
fn rescale(stab: Stabilization, m_old: f32, m_new: f32) -> f32 {
    match stab {
        Stabilization::None => 1.0,
        _ => (m_old - m_new).exp(),
    }
}

impl AttentionKernel for FlashAttention {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn config(&self) -> &AttentionConfig {
        &self.config
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Tensor> {
        let inputs = Inputs::prepare(q, k, v, dims)?;
        let (n, d) = (dims.seq_len, dims.head_dim);
        // Oversized blocks behave as a single block of N.
        let bc = self.config.key_block.min(n.max(1));
        let br = self.config.query_block.min(n.max(1));
        tracing::debug!("flash attention {} bc={} br={}", dims, bc, br);
        if dims.is_empty() {
            return Ok(Tensor::zeros(&dims.shape()));
        }
        let (qv, kv, vv) = inputs.views()?;
        let blocks_per_head = n.div_ceil(br);
        let degenerate = DegenerateRows::new(self.config.on_degenerate);

        let mut out = vec![0.0f32; dims.numel()];
        let units = split_units(&mut out, dims.head_len(), br * d);
        self.exec.run_units(
            units,
            || FlashScratch::new(br, bc),
            |scratch, unit, oi| {
                let (b, h) = dims.head_of(unit / blocks_per_head);
                let qb = unit % blocks_per_head;
                tracing::trace!("flash query block b={} h={} block={}", b, h, qb);
                self.query_block(
                    scratch,
                    &head_matrix(&qv, dims, b, h)?,
                    &head_matrix(&kv, dims, b, h)?,
                    &head_matrix(&vv, dims, b, h)?,
                    qb * br,
                    oi,
                    bc,
                    &degenerate,
                    (b, h),
                )
            },
        )?;
        degenerate.report(self.name());
        Tensor::from_vec(out, &dims.shape())
    }
}

/// Flash attention with key blocks of `bc` and query blocks of `br` rows,
/// sequential over query blocks.
pub fn flash_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    dims: AttnDims,
    bc: usize,
    br: usize,
) -> Result<Tensor> {
    FlashAttention::new(AttentionConfig::sequential().with_flash_blocks(bc, br))?.forward(q, k, v, dims)
}
