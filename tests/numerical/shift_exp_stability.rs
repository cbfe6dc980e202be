//! Numerical stability of the max-shift-exp reduction on long rows.
//!
//! These tests verify that:
//! 1. Kahan merging keeps f32 rows of 10^5 alternating-magnitude pairs accurate
//! 2. Rows whose exponents would overflow without shifting stay finite
//! 3. Half-precision element types stay within their expected error

use half::f16;
use pairwise_kernels::ops::softmax::{log_sum_exp, log_sum_exp_kahan, log_sum_exp_rows};
use pairwise_kernels::{
    Axis, Formula, Half2, KernelDispatcher, KernelFloat, LaunchConfig, MergeScheme, Reduction,
};

/// Generate deterministic test data.
fn generate_logits(n: usize, seed: u64, scale: f64) -> Vec<f64> {
    let mut data = Vec::with_capacity(n);
    let mut state = seed;
    for _ in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let val = ((state >> 32) as f64) / (u32::MAX as f64) * 2.0 - 1.0;
        data.push(val * scale);
    }
    data
}

/// One output row: `M = max_j f_j`, `S = Σ_j exp(f_j - M) · g_j`.
fn row_reduction() -> Reduction {
    Reduction::max_sum_shift_exp(Formula::vj(0, 1), Axis::I, Formula::vj(1, 1)).unwrap()
}

fn reduce_row<T: KernelFloat>(config: LaunchConfig, f: &[T], g: &[T]) -> [T; 2] {
    let mut out = [T::zero(); 2];
    KernelDispatcher::with_config(config)
        .reduce::<T, T>(&row_reduction(), 1, f.len(), &[f, g], &mut out, None)
        .unwrap();
    out
}

/// `Σ_j exp(f_j - M) · g_j` in f64.
fn reference_sum(f: &[f64], g: &[f64]) -> (f64, f64) {
    let m = f.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let s = f.iter().zip(g).map(|(&fj, &gj)| (fj - m).exp() * gj).sum();
    (m, s)
}

// =============================================================================
// Compensated merge
// =============================================================================

/// 10^5 pairs alternating between weight 1 and weight 0.3·e^-3: once the sum is
/// large, every small term is a few ulps and plain f32 accumulation drifts.
fn alternating_row(n: usize) -> (Vec<f32>, Vec<f32>) {
    let f = (0..n).map(|j| if j % 2 == 0 { 0.0 } else { -3.0 }).collect();
    let g = (0..n).map(|j| if j % 2 == 0 { 1.0 } else { 0.3 }).collect();
    (f, g)
}

#[test]
fn test_kahan_merge_beats_plain_on_alternating_magnitudes() {
    let n = 100_000;
    let (f, g) = alternating_row(n);
    let f64s: Vec<f64> = f.iter().map(|&x| x as f64).collect();
    let g64s: Vec<f64> = g.iter().map(|&x| x as f64).collect();
    let (m_ref, s_ref) = reference_sum(&f64s, &g64s);

    let plain = reduce_row(LaunchConfig::deterministic(), &f, &g);
    let kahan = reduce_row(
        LaunchConfig {
            merge: MergeScheme::Kahan,
            ..LaunchConfig::deterministic()
        },
        &f,
        &g,
    );

    assert_eq!(plain[0] as f64, m_ref);
    assert_eq!(kahan[0] as f64, m_ref);

    let plain_err = ((plain[1] as f64) - s_ref).abs() / s_ref;
    let kahan_err = ((kahan[1] as f64) - s_ref).abs() / s_ref;
    assert!(kahan_err < 1e-6, "Kahan relative error too large: {}", kahan_err);
    assert!(
        kahan_err * 10.0 < plain_err,
        "Kahan ({}) should be much better than plain ({})",
        kahan_err,
        plain_err
    );
}

#[test]
fn test_chunked_kahan_launch_on_long_row() {
    let n = 100_000;
    let (f, g) = alternating_row(n);
    let f64s: Vec<f64> = f.iter().map(|&x| x as f64).collect();
    let g64s: Vec<f64> = g.iter().map(|&x| x as f64).collect();
    let (_, s_ref) = reference_sum(&f64s, &g64s);

    let out = reduce_row(LaunchConfig::long_reduction(), &f, &g);
    let err = ((out[1] as f64) - s_ref).abs() / s_ref;
    assert!(err < 1e-6, "chunked Kahan relative error: {}", err);
}

#[test]
fn test_wide_accumulator_on_long_row() {
    let n = 100_000;
    let (f, g) = alternating_row(n);
    let f64s: Vec<f64> = f.iter().map(|&x| x as f64).collect();
    let g64s: Vec<f64> = g.iter().map(|&x| x as f64).collect();
    let (_, s_ref) = reference_sum(&f64s, &g64s);

    let mut out = [0.0_f32; 2];
    KernelDispatcher::with_config(LaunchConfig::deterministic())
        .reduce::<f64, f32>(&row_reduction(), 1, n, &[&f, &g], &mut out, None)
        .unwrap();
    let err = ((out[1] as f64) - s_ref).abs() / s_ref;
    assert!(err < 1e-6, "f64 accumulator relative error: {}", err);
}

// =============================================================================
// Overflow-free accumulation
// =============================================================================

#[test]
fn test_large_exponents_do_not_overflow() {
    // exp(800) overflows f64; the shifted sum never sees it.
    let n = 100_000;
    let f: Vec<f64> = generate_logits(n, 42, 800.0);
    let g = vec![1.0; n];

    let out = reduce_row(LaunchConfig::default(), &f, &g);
    assert!(out[0].is_finite() && out[1].is_finite(), "got {:?}", out);

    let lse = log_sum_exp_rows(&out).unwrap()[0];
    let expected = log_sum_exp(&f);
    assert!(
        (lse - expected).abs() / expected.abs() < 1e-12,
        "lse {} vs reference {}",
        lse,
        expected
    );
}

#[test]
fn test_increasing_row_rescales_every_step() {
    // Every pair raises the max, so every merge takes the rescaling branch.
    let n = 100_000;
    let f: Vec<f64> = (0..n).map(|j| j as f64 * 0.01).collect();
    let g = vec![1.0; n];

    let out = reduce_row(LaunchConfig::deterministic(), &f, &g);
    assert_eq!(out[0], (n - 1) as f64 * 0.01);

    let expected = log_sum_exp_kahan(&f);
    let lse = out[0] + out[1].ln();
    assert!(
        (lse - expected).abs() < 1e-9,
        "lse {} vs reference {}",
        lse,
        expected
    );
}

#[test]
fn test_f32_extreme_logits_stay_finite() {
    let n = 10_000;
    let f: Vec<f32> = generate_logits(n, 7, 1e4).iter().map(|&x| x as f32).collect();
    let g: Vec<f32> = generate_logits(n, 8, 1.0).iter().map(|&x| x as f32).collect();
    let f64s: Vec<f64> = f.iter().map(|&x| x as f64).collect();
    let g64s: Vec<f64> = g.iter().map(|&x| x as f64).collect();
    let (m_ref, s_ref) = reference_sum(&f64s, &g64s);
    let scale: f64 = f64s
        .iter()
        .zip(&g64s)
        .map(|(&fj, &gj)| (fj - m_ref).exp() * gj.abs())
        .sum();

    for config in [LaunchConfig::deterministic(), LaunchConfig::long_reduction()] {
        let out = reduce_row(config, &f, &g);
        assert_eq!(out[0] as f64, m_ref);
        assert!(out[1].is_finite(), "shifted sum not finite: {}", out[1]);
        let err = ((out[1] as f64) - s_ref).abs() / scale;
        assert!(err < 1e-4, "relative error {}", err);
    }
}

// =============================================================================
// Half precision
// =============================================================================

#[test]
fn test_f16_pairs_with_f32_accumulator() {
    let n = 2_000;
    let f: Vec<f16> = generate_logits(n, 3, 8.0).iter().map(|&x| f16::from_f64(x)).collect();
    let g: Vec<f16> = vec![f16::ONE; n];
    let f64s: Vec<f64> = f.iter().map(|x| x.to_f64()).collect();
    let (m_ref, s_ref) = reference_sum(&f64s, &vec![1.0; n]);

    let mut out = [f16::ZERO; 2];
    KernelDispatcher::with_config(LaunchConfig::deterministic())
        .reduce::<f32, f16>(&row_reduction(), 1, n, &[&f, &g], &mut out, None)
        .unwrap();

    assert_eq!(out[0].to_f64(), m_ref);
    let err = (out[1].to_f64() - s_ref).abs() / s_ref;
    assert!(err < 2e-3, "f16 output relative error: {}", err);
}

#[test]
fn test_half2_lanes_reduce_independently() {
    let n = 16;
    let lo = generate_logits(n, 11, 1.0);
    let hi = generate_logits(n, 12, 1.0);
    let f: Vec<Half2> = lo
        .iter()
        .zip(&hi)
        .map(|(&a, &b)| Half2::from_f32_pair(a as f32 - 1.0, b as f32 - 1.0))
        .collect();
    let g = vec![Half2::one(); n];

    let out = reduce_row(LaunchConfig::deterministic(), &f, &g);

    for lane in 0..2 {
        let logits: Vec<f64> = f.iter().map(|x| x.lane(lane)).collect();
        let (m_ref, s_ref) = reference_sum(&logits, &vec![1.0; n]);
        assert_eq!(out[0].lane(lane), m_ref, "lane {lane} max");
        let err = (out[1].lane(lane) - s_ref).abs() / s_ref;
        assert!(err < 3e-2, "lane {} relative error: {}", lane, err);
    }
}
