//! Cross-kernel integration tests: every kernel against the naive reference
//! on seeded random inputs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tessel_attention::{
    all_kernels, attention_weights, blocked_attention, flash_attention, fused_attention,
    naive_attention, AttentionConfig, AttnDims, KernelKind, Stabilization,
};
use tessel_core::Tensor;

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

fn random(rng: &mut StdRng, dims: AttnDims) -> Tensor {
    let data: Vec<f32> = (0..dims.numel()).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_f32(&data, &dims.shape())
}

fn random_qkv(seed: u64, dims: AttnDims) -> (Tensor, Tensor, Tensor) {
    let mut rng = StdRng::seed_from_u64(seed);
    (random(&mut rng, dims), random(&mut rng, dims), random(&mut rng, dims))
}

// ============================================================================
// Equivalence
// ============================================================================

#[test]
fn test_all_kernels_agree_on_random_inputs() {
    let shapes = [
        AttnDims::new(1, 1, 1, 1),
        AttnDims::new(1, 1, 2, 2),
        AttnDims::new(2, 3, 7, 5),
        AttnDims::new(1, 2, 33, 16),
        AttnDims::new(3, 1, 50, 8),
    ];
    let kernels = all_kernels(&AttentionConfig::default()).unwrap();
    for (seed, dims) in shapes.into_iter().enumerate() {
        let (q, k, v) = random_qkv(seed as u64, dims);
        let reference = naive_attention(&q, &k, &v, dims).unwrap().to_vec();
        for kernel in &kernels {
            let out = kernel.forward(&q, &k, &v, dims).unwrap();
            assert_eq!(out.dims(), &dims.shape());
            assert_close(&out.to_vec(), &reference, 1e-4);
        }
    }
}

#[test]
fn test_closed_form_example() {
    let x = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
    let dims = AttnDims::new(1, 1, 2, 2);
    let e = std::f32::consts::E;
    let (hi, lo) = (e / (e + 1.0), 1.0 / (e + 1.0));
    // O = P·V with V = I, so O = P.
    let expected = [hi, lo, lo, hi];

    for kernel in all_kernels(&AttentionConfig::default()).unwrap() {
        let out = kernel.forward(&x, &x, &x, dims).unwrap();
        assert_close(&out.to_vec(), &expected, 1e-6);
    }
    let flash = flash_attention(&x, &x, &x, dims, 1, 1).unwrap();
    assert_close(&flash.to_vec(), &expected, 1e-6);
}

#[test]
fn test_single_token_yields_value_exactly() {
    let dims = AttnDims::new(1, 1, 1, 1);
    let q = Tensor::from_f32(&[2.5], &[1, 1, 1, 1]);
    let k = Tensor::from_f32(&[-1.5], &[1, 1, 1, 1]);
    let v = Tensor::from_f32(&[0.3], &[1, 1, 1, 1]);
    for kernel in all_kernels(&AttentionConfig::default()).unwrap() {
        assert_eq!(kernel.forward(&q, &k, &v, dims).unwrap().to_vec(), vec![0.3], "{}", kernel.name());
    }
}

// ============================================================================
// Block-size invariance
// ============================================================================

#[test]
fn test_blocked_block_invariance() {
    let dims = AttnDims::new(2, 2, 19, 7);
    let (q, k, v) = random_qkv(100, dims);
    let reference = naive_attention(&q, &k, &v, dims).unwrap().to_vec();
    for block in [1, 3, 8, 19, 256] {
        let out = blocked_attention(&q, &k, &v, dims, block).unwrap();
        assert_close(&out.to_vec(), &reference, 1e-4);
    }
}

#[test]
fn test_flash_block_invariance() {
    let n = 23;
    let dims = AttnDims::new(1, 3, n, 8);
    let (q, k, v) = random_qkv(200, dims);
    let reference = naive_attention(&q, &k, &v, dims).unwrap().to_vec();
    for (bc, br) in [(n, n), (1, 1), (4, 4), (5, 7), (7, 5), (32, 3), (2, 64)] {
        let out = flash_attention(&q, &k, &v, dims, bc, br).unwrap();
        assert_close(&out.to_vec(), &reference, 1e-4);
    }
}

#[test]
fn test_fused_block_invariance() {
    let dims = AttnDims::new(1, 2, 15, 9);
    let (q, k, v) = random_qkv(300, dims);
    let reference = fused_attention(&q, &k, &v, dims).unwrap().to_vec();
    for block in [1, 4, 100] {
        let cfg = AttentionConfig::default().with_block(block);
        let out = KernelKind::Fused.build(cfg).unwrap().forward(&q, &k, &v, dims).unwrap();
        assert_close(&out.to_vec(), &reference, 1e-5);
    }
}

// ============================================================================
// Execution
// ============================================================================

#[test]
fn test_parallel_matches_sequential() {
    let dims = AttnDims::new(2, 4, 40, 8);
    let (q, k, v) = random_qkv(400, dims);
    let base = AttentionConfig::default().with_block(5).with_flash_blocks(6, 7);
    for kind in KernelKind::ALL {
        let seq = kind
            .build(AttentionConfig { parallel: false, ..base.clone() })
            .unwrap()
            .forward(&q, &k, &v, dims)
            .unwrap();
        for threads in [1, 2, 5] {
            let par = kind
                .build(base.clone().with_threads(threads))
                .unwrap()
                .forward(&q, &k, &v, dims)
                .unwrap();
            // Units are computed identically whichever worker runs them.
            assert_eq!(seq.to_vec(), par.to_vec(), "{} with {} threads", kind, threads);
        }
    }
}

#[test]
fn test_non_contiguous_inputs() {
    // Build (B, N, H, d) and swap to (B, H, N, d) without copying.
    let (b, h, n, d) = (2, 3, 6, 4);
    let dims = AttnDims::new(b, h, n, d);
    let mut rng = StdRng::seed_from_u64(500);
    let mut make = || {
        let data: Vec<f32> = (0..dims.numel()).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Tensor::from_f32(&data, &[b, n, h, d]).transpose(1, 2).unwrap()
    };
    let (q, k, v) = (make(), make(), make());
    assert!(!q.is_contiguous());

    let reference = naive_attention(&q.contiguous(), &k.contiguous(), &v.contiguous(), dims).unwrap();
    for kernel in all_kernels(&AttentionConfig::default()).unwrap() {
        let out = kernel.forward(&q, &k, &v, dims).unwrap();
        assert_close(&out.to_vec(), &reference.to_vec(), 1e-4);
    }
}

#[test]
fn test_inputs_are_not_mutated() {
    let dims = AttnDims::new(1, 2, 9, 3);
    let (q, k, v) = random_qkv(600, dims);
    let before = (q.to_vec(), k.to_vec(), v.to_vec());
    for kernel in all_kernels(&AttentionConfig::default()).unwrap() {
        kernel.forward(&q, &k, &v, dims).unwrap();
    }
    assert_eq!((q.to_vec(), k.to_vec(), v.to_vec()), before);
}

// ============================================================================
// Softmax
// ============================================================================

#[test]
fn test_probability_rows_sum_to_one() {
    let dims = AttnDims::new(2, 2, 12, 6);
    let (q, k, _) = random_qkv(700, dims);
    for stabilization in [Stabilization::None, Stabilization::RowMin, Stabilization::RowMax] {
        let cfg = AttentionConfig::default().with_stabilization(stabilization);
        let p = attention_weights(&q, &k, dims, &cfg).unwrap();
        assert_eq!(p.dims(), &[2, 2, 12, 12]);
        for row in p.to_vec().chunks(12) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "{:?}: row sums to {}", stabilization, sum);
            assert!(row.iter().all(|&x| x >= 0.0));
        }
    }
}

#[test]
fn test_scaled_scores_agree_across_kernels() {
    let dims = AttnDims::new(1, 2, 21, 16);
    let (q, k, v) = random_qkv(800, dims);
    let cfg = AttentionConfig::default()
        .with_scale(1.0 / (dims.head_dim as f32).sqrt())
        .with_stabilization(Stabilization::RowMax)
        .with_flash_blocks(4, 6);
    let kernels = all_kernels(&cfg).unwrap();
    let reference = kernels[0].forward(&q, &k, &v, dims).unwrap().to_vec();
    for kernel in &kernels[1..] {
        assert_close(&kernel.forward(&q, &k, &v, dims).unwrap().to_vec(), &reference, 1e-4);
    }
}

#[test]
fn test_row_max_keeps_large_scores_finite() {
    let dims = AttnDims::new(1, 1, 10, 4);
    let mut rng = StdRng::seed_from_u64(900);
    // Scores reach roughly 4·8·8 = 256.
    let data: Vec<f32> = (0..dims.numel()).map(|_| rng.gen_range(6.0f32..8.0)).collect();
    let q = Tensor::from_f32(&data, &dims.shape());
    let v = random(&mut rng, dims);

    let cfg = AttentionConfig::default()
        .with_stabilization(Stabilization::RowMax)
        .with_flash_blocks(3, 4);
    let kernels = all_kernels(&cfg).unwrap();
    let reference = kernels[0].forward(&q, &q, &v, dims).unwrap().to_vec();
    assert!(reference.iter().all(|x| x.is_finite()));
    assert!(reference.iter().any(|&x| x != 0.0));
    for kernel in &kernels[1..] {
        assert_close(&kernel.forward(&q, &q, &v, dims).unwrap().to_vec(), &reference, 1e-4);
    }
}

// ============================================================================
// Configuration and errors
// ============================================================================

#[test]
fn test_json_config_drives_every_kernel() {
    let cfg: AttentionConfig = serde_json::from_str(
        r#"{ "block": 3, "key_block": 5, "query_block": 2, "parallel": false }"#,
    )
    .unwrap();
    let dims = AttnDims::new(1, 1, 11, 4);
    let (q, k, v) = random_qkv(1000, dims);
    let reference = naive_attention(&q, &k, &v, dims).unwrap().to_vec();
    for kernel in all_kernels(&cfg).unwrap() {
        assert_eq!(kernel.config().block, 3);
        assert_close(&kernel.forward(&q, &k, &v, dims).unwrap().to_vec(), &reference, 1e-4);
    }
}

#[test]
fn test_shape_mismatch_rejected_by_every_kernel() {
    let dims = AttnDims::new(1, 2, 4, 3);
    let (q, k, _) = random_qkv(1100, dims);
    let v = Tensor::zeros(&[1, 2, 4, 2]);
    for kernel in all_kernels(&AttentionConfig::default()).unwrap() {
        assert!(kernel.forward(&q, &k, &v, dims).is_err(), "{}", kernel.name());
    }
}

#[test]
fn test_empty_dims_yield_empty_output() {
    for dims in [AttnDims::new(0, 2, 4, 3), AttnDims::new(1, 1, 0, 3), AttnDims::new(1, 1, 4, 0)] {
        let x = Tensor::zeros(&dims.shape());
        for kernel in all_kernels(&AttentionConfig::default()).unwrap() {
            let out = kernel.forward(&x, &x, &x, dims).unwrap();
            assert_eq!(out.dims(), &dims.shape());
            assert_eq!(out.numel(), 0);
        }
    }
}
