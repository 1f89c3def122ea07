//! Reference attention.
//!
//! O = softmax(scale · Q @ Kᵗ) @ V, computed per (b, h) head in three
//! separate phases over a fully materialised N×N score matrix. Every other
//! kernel is checked against this one.

use tessel_core::{Result, StridedView, StridedViewMut, Tensor};

use crate::config::AttentionConfig;
use crate::exec::{split_units, Executor};
use crate::kernel::{dot_from, head_matrix, AttentionKernel, AttnDims, Inputs};
use crate::softmax::{softmax_row, DegenerateRows, Stabilization};

/// Three-phase attention with an O(N²) score buffer per head.
pub struct NaiveAttention {
    config: AttentionConfig,
    exec: Executor,
}

impl NaiveAttention {
    pub fn new(config: AttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            exec: Executor::new(&config)?,
            config,
        })
    }

    /// The (B, H, N, N) probability matrix P = softmax(scale · Q @ Kᵗ).
    ///
    /// Degenerate rows follow the configured policy: they come back as zeros
    /// or fail the call.
    pub fn attention_weights(&self, q: &Tensor, k: &Tensor, dims: AttnDims) -> Result<Tensor> {
        dims.check(q)?;
        dims.check(k)?;
        let n = dims.seq_len;
        let out_shape = [dims.batch, dims.heads, n, n];
        if dims.is_empty() {
            return Ok(Tensor::zeros(&out_shape));
        }
        let q = q.contiguous();
        let k = k.contiguous();
        let (qv, kv) = (q.view()?, k.view()?);
        let degenerate = DegenerateRows::new(self.config.on_degenerate);

        let mut out = vec![0.0f32; dims.num_heads_total() * n * n];
        let units = split_units(&mut out, n * n, n * n);
        self.exec.run_units(units, || (), |_, unit, p| {
            let (b, h) = dims.head_of(unit);
            let mut p = StridedViewMut::matrix(p, n, n)?;
            score_matrix(&head_matrix(&qv, dims, b, h)?, &head_matrix(&kv, dims, b, h)?, &mut p, self.config.scale)?;
            normalize_scores(&mut p, self.config.stabilization, &degenerate, b, h)
        })?;
        degenerate.report("attention_weights");
        Tensor::from_vec(out, &out_shape)
    }
}

impl AttentionKernel for NaiveAttention {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn config(&self) -> &AttentionConfig {
        &self.config
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Tensor> {
        let inputs = Inputs::prepare(q, k, v, dims)?;
        tracing::debug!("naive attention {}", dims);
        if dims.is_empty() {
            return Ok(Tensor::zeros(&dims.shape()));
        }
        let (qv, kv, vv) = inputs.views()?;
        let n = dims.seq_len;
        let degenerate = DegenerateRows::new(self.config.on_degenerate);

        let mut out = vec![0.0f32; dims.numel()];
        let units = split_units(&mut out, dims.head_len(), dims.head_len());
        self.exec.run_units(
            units,
            || vec![0.0f32; n * n],
            |scores, unit, o| {
                let (b, h) = dims.head_of(unit);
                tracing::trace!("naive head b={} h={}", b, h);
                let v = head_matrix(&vv, dims, b, h)?;
                let mut s = StridedViewMut::matrix(scores, n, n)?;

                score_matrix(&head_matrix(&qv, dims, b, h)?, &head_matrix(&kv, dims, b, h)?, &mut s, self.config.scale)?;
                normalize_scores(&mut s, self.config.stabilization, &degenerate, b, h)?;

                let mut o = StridedViewMut::matrix(o, n, dims.head_dim)?;
                for i in 0..n {
                    let p = s.row(i)?;
                    for kk in 0..dims.head_dim {
                        let mut val = 0.0f32;
                        for j in 0..n {
                            val += p[j] * v.get(&[j, kk])?;
                        }
                        o.set(&[i, kk], val)?;
                    }
                }
                Ok(())
            },
        )?;
        degenerate.report(self.name());
        Tensor::from_vec(out, &dims.shape())
    }
}

/// S[i, k] = scale · Σ_j Q[i, j]·K[k, j] for one head.
fn score_matrix(
    q: &StridedView<'_>,
    k: &StridedView<'_>,
    s: &mut StridedViewMut<'_>,
    scale: f32,
) -> Result<()> {
    let n = q.dims()[0];
    for i in 0..n {
        let q_row = q.row(i)?;
        let s_row = s.row_mut(i)?;
        for (kk, slot) in s_row.iter_mut().enumerate() {
            *slot = scale * dot_from(0.0, q_row, k.row(kk)?);
        }
    }
    Ok(())
}

/// Row-wise softmax over a full score matrix, recording degenerate rows.
pub(crate) fn normalize_scores(
    s: &mut StridedViewMut<'_>,
    stabilization: Stabilization,
    degenerate: &DegenerateRows,
    b: usize,
    h: usize,
) -> Result<()> {
    for i in 0..s.dims()[0] {
        if !softmax_row(s.row_mut(i)?, stabilization) {
            degenerate.record(b, h, i)?;
        }
    }
    Ok(())
}

/// The (B, H, N, N) probability matrix under `config`.
pub fn attention_weights(
    q: &Tensor,
    k: &Tensor,
    dims: AttnDims,
    config: &AttentionConfig,
) -> Result<Tensor> {
    NaiveAttention::new(config.clone())?.attention_weights(q, k, dims)
}

/// Reference attention with default settings, sequential over heads.
pub fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Tensor> {
    NaiveAttention::new(AttentionConfig::sequential())?.forward(q, k, v, dims)
}
