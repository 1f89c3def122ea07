//! # tessel-attention
//!
//! Exact scaled dot-product attention, O = softmax(scale · Q·Kᵗ)·V, over
//! (B, H, N, d) row-major f32 tensors.
//!
//! Provides:
//! - `NaiveAttention`: full score matrix, full softmax, full weighted sum
//! - `BlockedAttention`: the same phases with cache-tiled multiplies
//! - `FusedAttention`: one parallel unit per output row, O(N) scratch
//! - `FlashAttention`: streaming key/query blocks with an online normaliser
//!
//! All four compute the same function and are interchangeable through the
//! `AttentionKernel` trait.
//!
//! ```
//! use tessel_attention::{all_kernels, AttentionConfig, AttnDims};
//! use tessel_core::Tensor;
//!
//! let x = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
//! let dims = AttnDims::new(1, 1, 2, 2);
//! let kernels = all_kernels(&AttentionConfig::default()).unwrap();
//! let reference = kernels[0].forward(&x, &x, &x, dims).unwrap();
//! for kernel in &kernels[1..] {
//!     let out = kernel.forward(&x, &x, &x, dims).unwrap();
//!     assert!(out.max_abs_diff(&reference).unwrap() < 1e-5);
//! }
//! ```

pub mod config;
pub mod softmax;
pub mod exec;
pub mod scratch;
pub mod kernel;
pub mod naive;
pub mod blocked;
pub mod fused;
pub mod flash;

pub use blocked::{blocked_attention, BlockedAttention};
pub use config::AttentionConfig;
pub use exec::Executor;
pub use flash::{flash_attention, FlashAttention};
pub use fused::{fused_attention, FusedAttention};
pub use kernel::{all_kernels, kernel_by_name, AttentionKernel, AttnDims, KernelKind};
pub use naive::{attention_weights, naive_attention, NaiveAttention};
pub use scratch::ScratchPool;
pub use softmax::{softmax_row, softmax_rows, DegeneratePolicy, Stabilization};
