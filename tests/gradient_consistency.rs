//! Gradient of the max-sum-shift-exp reduction against finite differences.
//!
//! Forward: `f_ij = b_j - s · |x_i - y_j|²` reduced over `j`. Two consumers:
//! - log-sum-exp, objective `J = Σ_i w_i (M_i + ln S_i)`;
//! - softmax-weighted average of `v_j`, objective `J = Σ_i u_i · R_i` with
//!   `R_i = Σ_j softmax_j(f_ij) v_j`.
//!
//! The backward reductions are built symbolically and run through the same
//! dispatcher.

use pairwise_kernels::ops::softmax::{
    log_sum_exp_rows, lse_upstream_gradient, softmax_upstream_gradient, softmax_weight_rows,
    sum_softmax_weight,
};
use pairwise_kernels::{
    Axis, Category, Formula, KernelDispatcher, LaunchConfig, MergeScheme, Reduction,
};

const NX: usize = 4;
const NY: usize = 6;
const D: usize = 2;

const X: usize = 0;
const Y: usize = 1;
const B: usize = 2;
const S: usize = 3;
const GRADIN: usize = 4;
const OUT: usize = 5;
const V: usize = 6;
const DV: usize = 2;

struct Problem {
    xs: Vec<f64>,
    ys: Vec<f64>,
    bs: Vec<f64>,
    scale: Vec<f64>,
    vs: Vec<f64>,
    weights: Vec<f64>,
    /// `∂J/∂R` for the softmax objective, `DV` per row.
    softmax_weights: Vec<f64>,
}

fn generate(n: usize, seed: u64, amplitude: f64) -> Vec<f64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (((state >> 11) as f64) / ((1u64 << 53) as f64) * 2.0 - 1.0) * amplitude
        })
        .collect()
}

fn problem() -> Problem {
    Problem {
        xs: generate(NX * D, 1, 1.0),
        ys: generate(NY * D, 2, 1.0),
        bs: generate(NY, 3, 0.5),
        scale: vec![0.7],
        vs: generate(NY * DV, 4, 2.0),
        weights: vec![1.0, -0.5, 2.0, 0.25],
        softmax_weights: vec![1.0, 0.5, -1.5, 2.0, 0.75, -0.25, 1.25, 0.3],
    }
}

fn logits() -> Formula {
    let x = Formula::vi(X, D);
    let y = Formula::vj(Y, D);
    let b = Formula::vj(B, 1);
    let s = Formula::param(S, 1);
    x.sub(&y)
        .unwrap()
        .sqnorm2()
        .unwrap()
        .mul(&s)
        .unwrap()
        .neg()
        .add(&b)
        .unwrap()
}

fn forward_reduction() -> Reduction {
    Reduction::log_sum_exp(logits(), Axis::I).unwrap()
}

fn softmax_reduction() -> Reduction {
    sum_softmax_weight(logits(), Axis::I, Formula::vj(V, DV)).unwrap()
}

fn dispatcher() -> KernelDispatcher {
    KernelDispatcher::with_config(LaunchConfig::deterministic())
}

fn forward(p: &Problem) -> Vec<f64> {
    let red = forward_reduction();
    let mut out = vec![0.0; NX * 2];
    dispatcher()
        .reduce::<f64, f64>(&red, NX, NY, &[&p.xs, &p.ys, &p.bs, &p.scale], &mut out, None)
        .unwrap();
    out
}

fn objective(p: &Problem) -> f64 {
    let lse = log_sum_exp_rows(&forward(p)).unwrap();
    lse.iter().zip(&p.weights).map(|(l, w)| l * w).sum()
}

/// Run the symbolic gradient with respect to `target` using `gradin` as upstream.
fn symbolic(p: &Problem, target: &Formula, gradin: &[f64]) -> Vec<f64> {
    let red = forward_reduction();
    let out = forward(p);
    let gradin_var = Formula::var(GRADIN, 2, Category::I);
    let out_var = Formula::var(OUT, 2, Category::I);
    let grad_red = red.gradient(target, &gradin_var, &out_var).unwrap();

    let rows = match grad_red.axis() {
        Axis::I => NX,
        Axis::J => NY,
    };
    let mut grad = vec![0.0; rows * grad_red.dim()];
    dispatcher()
        .reduce::<f64, f64>(
            &grad_red,
            NX,
            NY,
            &[&p.xs, &p.ys, &p.bs, &p.scale, gradin, &out],
            &mut grad,
            None,
        )
        .unwrap();
    grad
}

fn conforming_gradin(p: &Problem) -> Vec<f64> {
    lse_upstream_gradient(&p.weights, &forward(p)).unwrap()
}

fn softmax_forward(p: &Problem) -> Vec<f64> {
    let red = softmax_reduction();
    let unused: &[f64] = &[];
    let mut out = vec![0.0; NX * red.dim()];
    dispatcher()
        .reduce::<f64, f64>(
            &red,
            NX,
            NY,
            &[&p.xs, &p.ys, &p.bs, &p.scale, unused, unused, &p.vs],
            &mut out,
            None,
        )
        .unwrap();
    out
}

fn softmax_objective(p: &Problem) -> f64 {
    let avg = softmax_weight_rows(&softmax_forward(p), DV).unwrap();
    avg.iter().zip(&p.softmax_weights).map(|(r, u)| r * u).sum()
}

fn softmax_symbolic(p: &Problem, target: &Formula) -> Vec<f64> {
    let red = softmax_reduction();
    let out = softmax_forward(p);
    let gradin = softmax_upstream_gradient(&p.softmax_weights, &out, DV).unwrap();
    let grad_red = red
        .gradient(
            target,
            &Formula::var(GRADIN, red.dim(), Category::I),
            &Formula::var(OUT, red.dim(), Category::I),
        )
        .unwrap();
    assert_eq!(grad_red.axis(), Axis::J);

    let mut grad = vec![0.0; NY * grad_red.dim()];
    dispatcher()
        .reduce::<f64, f64>(
            &grad_red,
            NX,
            NY,
            &[&p.xs, &p.ys, &p.bs, &p.scale, &gradin, &out, &p.vs],
            &mut grad,
            None,
        )
        .unwrap();
    grad
}

/// Central differences of the log-sum-exp objective with respect to one buffer.
fn numeric(p: &Problem, select: fn(&mut Problem) -> &mut Vec<f64>) -> Vec<f64> {
    numeric_with(p, objective, select)
}

/// Central differences of `objective` with respect to every entry of one buffer.
fn numeric_with(
    p: &Problem,
    objective: fn(&Problem) -> f64,
    select: fn(&mut Problem) -> &mut Vec<f64>,
) -> Vec<f64> {
    let h = 1e-5;
    let n = select(&mut clone(p)).len();
    (0..n)
        .map(|k| {
            let mut plus = clone(p);
            let mut minus = clone(p);
            select(&mut plus)[k] += h;
            select(&mut minus)[k] -= h;
            (objective(&plus) - objective(&minus)) / (2.0 * h)
        })
        .collect()
}

fn clone(p: &Problem) -> Problem {
    Problem {
        xs: p.xs.clone(),
        ys: p.ys.clone(),
        bs: p.bs.clone(),
        scale: p.scale.clone(),
        vs: p.vs.clone(),
        weights: p.weights.clone(),
        softmax_weights: p.softmax_weights.clone(),
    }
}

fn assert_close(symbolic: &[f64], numeric: &[f64], what: &str) {
    assert_eq!(symbolic.len(), numeric.len(), "{what}: length");
    for (k, (&a, &b)) in symbolic.iter().zip(numeric).enumerate() {
        let scale = a.abs().max(b.abs()).max(1e-3);
        assert!(
            (a - b).abs() / scale < 1e-4,
            "{what}[{k}]: symbolic {a} vs finite difference {b}"
        );
    }
}

#[test]
fn gradient_wrt_column_variable() {
    let p = problem();
    let grad = symbolic(&p, &Formula::vj(Y, D), &conforming_gradin(&p));
    assert_close(&grad, &numeric(&p, |p| &mut p.ys), "dJ/dy");
}

#[test]
fn gradient_wrt_column_bias() {
    let p = problem();
    let grad = symbolic(&p, &Formula::vj(B, 1), &conforming_gradin(&p));
    assert_close(&grad, &numeric(&p, |p| &mut p.bs), "dJ/db");

    // Each bias shifts its column's softmax weight: Σ_j dJ/db_j = Σ_i w_i.
    let total: f64 = grad.iter().sum();
    let weights: f64 = p.weights.iter().sum();
    assert!((total - weights).abs() < 1e-12, "{total} vs {weights}");
}

#[test]
fn gradient_wrt_row_variable() {
    let p = problem();
    let grad = symbolic(&p, &Formula::vi(X, D), &conforming_gradin(&p));
    assert_close(&grad, &numeric(&p, |p| &mut p.xs), "dJ/dx");
}

#[test]
fn gradient_wrt_parameter_leaves_sum_over_rows() {
    let p = problem();
    let red = forward_reduction();
    let gradin_var = Formula::var(GRADIN, 2, Category::I);
    let out_var = Formula::var(OUT, 2, Category::I);
    let grad_red = red.gradient(&Formula::param(S, 1), &gradin_var, &out_var).unwrap();
    assert_eq!(grad_red.axis(), Axis::I);

    // One partial per row; the caller finishes the reduction over i.
    let partials = symbolic(&p, &Formula::param(S, 1), &conforming_gradin(&p));
    assert_eq!(partials.len(), NX);
    let total: f64 = partials.iter().sum();
    assert_close(&[total], &numeric(&p, |p| &mut p.scale), "dJ/ds");
}

#[test]
fn gradient_through_kahan_launch_matches() {
    let p = problem();
    let gradin = conforming_gradin(&p);
    let red = forward_reduction();
    let out = forward(&p);
    let grad_red = red
        .gradient(
            &Formula::vj(Y, D),
            &Formula::var(GRADIN, 2, Category::I),
            &Formula::var(OUT, 2, Category::I),
        )
        .unwrap();

    let mut grad = vec![0.0; NY * D];
    KernelDispatcher::with_config(LaunchConfig {
        merge: MergeScheme::Kahan,
        chunk_size: 3,
        parallel: true,
    })
    .reduce::<f64, f64>(
        &grad_red,
        NX,
        NY,
        &[&p.xs, &p.ys, &p.bs, &p.scale, &gradin, &out],
        &mut grad,
        None,
    )
    .unwrap();
    assert_close(&grad, &numeric(&p, |p| &mut p.ys), "dJ/dy (kahan)");
}

#[test]
fn nonconforming_upstream_gradient_is_silently_wrong() {
    let p = problem();
    let out = forward(&p);
    // [w, w] instead of [w, w / S]
    let wrong: Vec<f64> = p.weights.iter().flat_map(|&w| [w, w]).collect();
    let grad = symbolic(&p, &Formula::vj(Y, D), &wrong);
    let expected = numeric(&p, |p| &mut p.ys);

    assert!(grad.iter().all(|g| g.is_finite()));
    // Every S_i > 1, so the result is off by a per-row factor.
    assert!(out.chunks(2).all(|r| r[1] > 1.0));
    let max_rel = grad
        .iter()
        .zip(&expected)
        .map(|(a, b)| (a - b).abs() / b.abs().max(1e-3))
        .fold(0.0, f64::max);
    assert!(max_rel > 1e-2, "non-conforming gradient unexpectedly matched: {max_rel}");
}

#[test]
fn softmax_weight_gradient_wrt_column_variable() {
    let p = problem();
    let grad = softmax_symbolic(&p, &Formula::vj(Y, D));
    assert_close(&grad, &numeric_with(&p, softmax_objective, |p| &mut p.ys), "dJ/dy (softmax)");
}

#[test]
fn softmax_weight_gradient_wrt_values() {
    let p = problem();
    let grad = softmax_symbolic(&p, &Formula::vj(V, DV));
    assert_close(&grad, &numeric_with(&p, softmax_objective, |p| &mut p.vs), "dJ/dv");

    // R_i is linear in v with softmax coefficients, so Σ_j dJ/dv_j[c] = Σ_i u_i[c].
    for c in 0..DV {
        let total: f64 = grad.iter().skip(c).step_by(DV).sum();
        let expected: f64 = p.softmax_weights.iter().skip(c).step_by(DV).sum();
        assert!((total - expected).abs() < 1e-12, "component {c}: {total} vs {expected}");
    }
}

#[test]
fn softmax_weight_gradient_ignores_max_slot() {
    let p = problem();
    let out = softmax_forward(&p);
    let gradin = softmax_upstream_gradient(&p.softmax_weights, &out, DV).unwrap();
    assert!(gradin.chunks(DV + 2).all(|r| r[0] == 0.0));

    // A lse-style upstream gradient has the wrong length for this output.
    assert!(lse_upstream_gradient(&p.weights, &out).is_err());
}
