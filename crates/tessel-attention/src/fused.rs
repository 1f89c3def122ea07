//! Row-fused attention.
//!
//! One unit per (b, h, i) output row. A unit scores its query against every
//! key into an N-length scratch row, normalises that row and immediately
//! contracts it with V into its own d-length slice of O. The N×N score matrix
//! never exists.

use tessel_core::{Result, Tensor};

use crate::config::AttentionConfig;
use crate::exec::{split_units, Executor};
use crate::kernel::{dot_from, head_matrix, AttentionKernel, AttnDims, Inputs};
use crate::scratch::ScratchPool;
use crate::softmax::{softmax_row, DegenerateRows};

pub struct FusedAttention {
    config: AttentionConfig,
    exec: Executor,
}

impl FusedAttention {
    pub fn new(config: AttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            exec: Executor::new(&config)?,
            config,
        })
    }
}

impl AttentionKernel for FusedAttention {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn config(&self) -> &AttentionConfig {
        &self.config
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Tensor> {
        let inputs = Inputs::prepare(q, k, v, dims)?;
        let block = self.config.block;
        if dims.is_empty() {
            return Ok(Tensor::zeros(&dims.shape()));
        }
        let (qv, kv, vv) = inputs.views()?;
        let (n, d) = (dims.seq_len, dims.head_dim);
        let scratch = ScratchPool::new(self.exec.concurrency(), n);
        tracing::debug!(
            "fused attention {} block={} scratch_slots={}",
            dims,
            block,
            scratch.slots()
        );
        let degenerate = DegenerateRows::new(self.config.on_degenerate);

        let mut out = vec![0.0f32; dims.numel()];
        let units = split_units(&mut out, d, d);
        self.exec.run_units(units, || (), |_, unit, o_row| {
            let (b, h, i) = dims.row_of(unit);
            let q_row = qv.slice_at(&[b, h, i])?;
            let keys = head_matrix(&kv, dims, b, h)?;
            let values = head_matrix(&vv, dims, b, h)?;

            scratch.with_row(|s_row| -> Result<()> {
                for kk in (0..n).step_by(block) {
                    let k_end = (kk + block).min(n);
                    for jj in (0..d).step_by(block) {
                        let j_end = (jj + block).min(d);
                        for key in kk..k_end {
                            s_row[key] = dot_from(s_row[key], &q_row[jj..j_end], &keys.row(key)?[jj..j_end]);
                        }
                    }
                }
                if self.config.scale != 1.0 {
                    s_row.iter_mut().for_each(|x| *x *= self.config.scale);
                }
                if !softmax_row(s_row, self.config.stabilization) {
                    degenerate.record(b, h, i)?;
                    return Ok(());
                }

                for kk in (0..d).step_by(block) {
                    let k_end = (kk + block).min(d);
                    for jj in (0..n).step_by(block) {
                        let j_end = (jj + block).min(n);
                        for col in kk..k_end {
                            let mut acc = o_row[col];
                            for j in jj..j_end {
                                acc += s_row[j] * values.row(j)?[col];
                            }
                            o_row[col] = acc;
                        }
                    }
                }
                Ok(())
            })
        })?;
        degenerate.report(self.name());
        Tensor::from_vec(out, &dims.shape())
    }
}

/// Row-fused attention with default settings on the global rayon pool.
pub fn fused_attention(q: &Tensor, k: &Tensor, v: &Tensor, dims: AttnDims) -> Result<Tensor> {
    FusedAttention::new(AttentionConfig::default())?.forward(q, k, v, dims)
}
