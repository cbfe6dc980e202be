//! Online max-shift-exp reduction.
//!
//! For a scalar formula `f` and a vector formula `g`, each output row holds
//!
//! ```text
//! M = max_j f_ij
//! S = Σ_j exp(f_ij - M) · g_ij
//! ```
//!
//! computed in one pass without overflow: the accumulator keeps the running max in
//! slot 0 and the sum shifted by that max in slots `1..`. When a larger value
//! arrives the existing sum is rescaled by `exp(m_old - m_new)` before adding.
//! With `g = 1`, `M + ln S` is the log-sum-exp of the row.
//!
//! The output is the raw accumulator `[M, S...]`; un-shifting, `ln` and softmax
//! normalization are left to the caller (see [`crate::ops::softmax`]).
//!
//! # Gradient precondition
//!
//! [`ReductionOp::gradient`] assumes the output is consumed only through functions
//! that are unchanged when `M` moves and `S` is rescaled to match, and that the
//! upstream gradient is laid out accordingly:
//!
//! - log-sum-exp, `L = M + ln S`: `[∂J/∂L, (∂J/∂L) / S]`, built by
//!   [`crate::ops::softmax::lse_upstream_gradient`];
//! - softmax weights, `R = S[1..] / S[0]`: `[0, ∂J/∂S[0], ∂J/∂S[1..]]`, built by
//!   [`crate::ops::softmax::softmax_upstream_gradient`].
//!
//! Under that assumption the contribution of `M` cancels and the gradient is that of
//! a plain sum of `exp(f - M) · g` with `M` held constant, seeded with the `S` slice
//! of the upstream gradient. **This is not checked.** Feeding any other upstream
//! gradient produces a finite, well-formed and wrong result.
//!
//! # Neutral element
//!
//! For `f32` and `f64` the neutral max is `-inf`. Merging two neutral accumulators,
//! or a pair with `f = -inf` into a fresh accumulator, computes `-inf - -inf` and
//! yields `S = NaN`, which then propagates through the rest of the row. Masked pairs
//! should use a large finite negative `f` instead. The dispatcher never merges two
//! neutral partials. Half-precision types use the finite `-65504` and are unaffected.

use std::fmt;

use super::{Reduction, ReductionOp, SumReduction};
use crate::error::{ReductionError, ReductionResult};
use crate::formula::{Axis, Formula};
use crate::kernel_types::{Accumulate, KernelFloat};
use crate::ops::stable_accumulator::kahan_add;

#[derive(Debug, Clone)]
pub struct MaxSumShiftExpReduction {
    f: Formula,
    g: Formula,
    axis: Axis,
    /// `Concat(f, g)`, the per-pair buffer layout.
    formula: Formula,
}

impl MaxSumShiftExpReduction {
    /// Fails with [`ReductionError::ScalarFormulaRequired`] unless `dim(f) == 1`.
    pub fn new(f: Formula, axis: Axis, g: Formula) -> ReductionResult<Self> {
        if f.dim() != 1 {
            return Err(ReductionError::ScalarFormulaRequired { dim: f.dim() });
        }
        let formula = f.concat(&g);
        Ok(Self { f, g, axis, formula })
    }

    /// `g = 1`.
    pub fn log_sum_exp(f: Formula, axis: Axis) -> ReductionResult<Self> {
        Self::new(f, axis, Formula::int(1))
    }

    pub fn f(&self) -> &Formula {
        &self.f
    }

    pub fn g(&self) -> &Formula {
        &self.g
    }
}

/// Rescale factors for merging a pair with max `m_in` into an accumulator with max `m`.
///
/// Returns `(keep, scale_in)` so that the merged sum is `s·keep + s_in·scale_in`:
/// `(1, exp(m_in - m))` when `m > m_in`, `(exp(m - m_in), 1)` otherwise. One `exp`
/// per merge; lane-wise selects for packed types.
#[inline(always)]
fn shift_factors<A: KernelFloat>(m: A, m_in: A) -> (A, A) {
    let d = A::select_gt(m, m_in, m_in - m, m - m_in);
    let e = d.exp();
    (
        A::select_gt(m, m_in, A::one(), e),
        A::select_gt(m, m_in, e, A::one()),
    )
}

impl ReductionOp for MaxSumShiftExpReduction {
    fn formula(&self) -> &Formula {
        &self.formula
    }

    fn axis(&self) -> Axis {
        self.axis
    }

    fn dim_red(&self) -> usize {
        1 + self.g.dim()
    }

    fn dim(&self) -> usize {
        1 + self.g.dim()
    }

    /// `M = neg_limit()`, `S = 0`.
    #[inline(always)]
    fn initialize<A: KernelFloat>(&self, acc: &mut [A]) {
        acc[0] = A::neg_limit();
        acc[1..].fill(A::zero());
    }

    #[inline(always)]
    fn reduce_pair<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T]) {
        let m = acc[0];
        let m_in = A::promote(xi[0]);
        let (keep, scale_in) = shift_factors(m, m_in);
        for (a, &x) in acc[1..].iter_mut().zip(&xi[1..]) {
            *a = *a * keep + A::promote(x) * scale_in;
        }
        acc[0] = A::select_gt(m, m_in, m, m_in);
    }

    fn kahan_dim(&self) -> usize {
        self.g.dim()
    }

    /// Compensated merge; the residual of every sum slot is rescaled with the slot.
    #[inline(always)]
    fn kahan_scheme<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T], comp: &mut [A]) {
        let m = acc[0];
        let m_in = A::promote(xi[0]);
        let (keep, scale_in) = shift_factors(m, m_in);
        for ((a, c), &x) in acc[1..].iter_mut().zip(comp.iter_mut()).zip(&xi[1..]) {
            let mut s = *a * keep;
            let mut r = *c * keep;
            kahan_add(&mut s, &mut r, A::promote(x) * scale_in);
            *a = s;
            *c = r;
        }
        acc[0] = A::select_gt(m, m_in, m, m_in);
    }

    fn apply_compensation<A: KernelFloat>(&self, acc: &mut [A], comp: &[A]) {
        for (a, &c) in acc[1..].iter_mut().zip(comp) {
            *a = *a - c;
        }
    }

    /// Gradient of a plain sum of `exp(f - M) · g` seeded with the `S` slice of
    /// `gradin`. See the module docs for the precondition on `gradin`.
    fn gradient(&self, v: &Formula, gradin: &Formula, out: &Formula) -> ReductionResult<Reduction> {
        let dim_red = self.dim_red();
        if gradin.dim() != dim_red {
            return Err(ReductionError::DimensionMismatch {
                op: "max_sum_shift_exp gradient input",
                left: dim_red,
                right: gradin.dim(),
            });
        }
        if out.dim() != dim_red {
            return Err(ReductionError::DimensionMismatch {
                op: "max_sum_shift_exp forward output",
                left: dim_red,
                right: out.dim(),
            });
        }
        let m = out.extract(0, 1)?;
        let s_grad = gradin.extract(1, dim_red - 1)?;
        let weighted = self.f.sub(&m)?.exp().scal(&self.g)?;
        SumReduction::new(weighted, self.axis).gradient(v, &s_grad, out)
    }
}

impl fmt::Display for MaxSumShiftExpReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaxSumShiftExp(f={},axis={},g={})", self.f, self.axis, self.g)
    }
}
