//! Log-space post-processing of max-shift-exp outputs.
//!
//! The reduction returns the raw `[M, S...]` accumulator. This module turns it into
//! the quantities callers actually want (log-sum-exp, softmax-weighted averages)
//! and builds, for each of them, the upstream gradient layout the reduction's
//! gradient expects.
//! The scalar `f64` helpers at the top are reference implementations used in tests
//! and for small host-side computations.

use crate::error::{ReductionError, ReductionResult};
use crate::formula::{Axis, Formula};
use crate::kernel_types::KernelFloat;
use crate::reductions::Reduction;

/// Compute log(sum(exp(x))) in a numerically stable way.
#[inline]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if max.is_infinite() {
        return max;
    }

    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();

    max + sum.ln()
}

/// Compute log(sum(exp(x))) using Kahan summation for the exp sum.
pub fn log_sum_exp_kahan(values: &[f64]) -> f64 {
    use super::stable_accumulator::KahanAccumulator;

    if values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if max.is_infinite() {
        return max;
    }

    let mut sum = KahanAccumulator::<f64>::new();
    for &x in values {
        sum.add((x - max).exp());
    }

    max + sum.corrected_value().ln()
}

fn check_rows(op: &'static str, len: usize, row: usize) -> ReductionResult<usize> {
    if row == 0 || len % row != 0 {
        return Err(ReductionError::DimensionMismatch { op, left: len, right: row });
    }
    Ok(len / row)
}

/// `L = M + ln S` for each `[M, S]` row of a log-sum-exp output (`dim(g) = 1`).
///
/// A row with no pairs (`S = 0`) yields `-inf`.
pub fn log_sum_exp_rows<T: KernelFloat>(out: &[T]) -> ReductionResult<Vec<T>> {
    check_rows("log_sum_exp_rows", out.len(), 2)?;
    Ok(out.chunks_exact(2).map(|r| r[0] + r[1].ln()).collect())
}

/// Upstream gradient `[∂J/∂L, (∂J/∂L) / S]` per row, for `L = M + ln S`.
///
/// `out` is the forward `[M, S]` output, `grad_l` holds `∂J/∂L` per row. See
/// [`softmax_upstream_gradient`] for outputs consumed as softmax weights.
pub fn lse_upstream_gradient<T: KernelFloat>(grad_l: &[T], out: &[T]) -> ReductionResult<Vec<T>> {
    let rows = check_rows("lse_upstream_gradient", out.len(), 2)?;
    if rows != grad_l.len() {
        return Err(ReductionError::DimensionMismatch {
            op: "lse_upstream_gradient",
            left: rows,
            right: grad_l.len(),
        });
    }
    let mut grad = Vec::with_capacity(out.len());
    for (&gl, r) in grad_l.iter().zip(out.chunks_exact(2)) {
        grad.push(gl);
        grad.push(gl / r[1]);
    }
    Ok(grad)
}

/// Softmax-weighted sum: `G = Concat(1, v)`, output rows `[M, Σ w, Σ w·v]`
/// with `w = exp(f - M)`.
pub fn sum_softmax_weight(f: Formula, axis: Axis, v: Formula) -> ReductionResult<Reduction> {
    Reduction::max_sum_shift_exp(f, axis, Formula::int(1).concat(&v))
}

/// Upstream gradient for outputs consumed through [`softmax_weight_rows`].
///
/// For `R = S[1..] / S[0]` and `grad_r = ∂J/∂R` (`dim_v` values per row), each row is
/// `[0, -Σ_c grad_r[c] · R[c] / S[0], grad_r / S[0]]`. `R` does not change when every
/// `S` slot is scaled by the same factor, so the `M` slot receives no gradient.
pub fn softmax_upstream_gradient<T: KernelFloat>(
    grad_r: &[T],
    out: &[T],
    dim_v: usize,
) -> ReductionResult<Vec<T>> {
    let rows = check_rows("softmax_upstream_gradient", out.len(), dim_v + 2)?;
    if rows * dim_v != grad_r.len() {
        return Err(ReductionError::DimensionMismatch {
            op: "softmax_upstream_gradient",
            left: rows * dim_v,
            right: grad_r.len(),
        });
    }
    let mut grad = Vec::with_capacity(out.len());
    for (k, r) in out.chunks_exact(dim_v + 2).enumerate() {
        let g = &grad_r[k * dim_v..(k + 1) * dim_v];
        let norm = r[1];
        let mut d_norm = T::zero();
        for (&gc, &sc) in g.iter().zip(&r[2..]) {
            d_norm = d_norm - gc * (sc / norm) / norm;
        }
        grad.push(T::zero());
        grad.push(d_norm);
        grad.extend(g.iter().map(|&gc| gc / norm));
    }
    Ok(grad)
}

/// Normalize [`sum_softmax_weight`] rows into `Σ softmax(f) · v` (`dim_v` values per row).
pub fn softmax_weight_rows<T: KernelFloat>(out: &[T], dim_v: usize) -> ReductionResult<Vec<T>> {
    check_rows("softmax_weight_rows", out.len(), dim_v + 2)?;
    let mut rows = Vec::with_capacity(out.len() / (dim_v + 2) * dim_v);
    for r in out.chunks_exact(dim_v + 2) {
        let norm = r[1];
        rows.extend(r[2..].iter().map(|&s| s / norm));
    }
    Ok(rows)
}
