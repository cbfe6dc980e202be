//! Reductions folding per-pair formula results into per-row accumulators.
//!
//! Every reduction follows the same lifecycle, driven by the dispatcher:
//!
//! 1. [`ReductionOp::initialize`] writes the neutral element into a fresh accumulator
//!    of length [`ReductionOp::dim_red`].
//! 2. For each inner index `j`, the pair formula is evaluated into a pair buffer and
//!    merged with [`ReductionOp::reduce_pair_short`] (or
//!    [`ReductionOp::kahan_scheme`] for the compensated launch).
//! 3. Partial accumulators of one row may be combined with
//!    [`ReductionOp::reduce_pair`]; the merge is associative and commutative.
//! 4. [`ReductionOp::finalize_output`] copies the accumulator into the output row.
//!
//! The merge methods are generic over the element type `T` and an accumulator type
//! `A` that may be wider than `T`, so the trait is not object safe. The closed set of
//! reductions is the [`Reduction`] enum, matched once per launch.

pub mod max_sum_shift_exp;
pub mod sum;

use std::fmt;

pub use max_sum_shift_exp::MaxSumShiftExpReduction;
pub use sum::SumReduction;

use crate::error::ReductionResult;
use crate::formula::{Axis, Formula};
use crate::kernel_types::{Accumulate, KernelFloat};

/// Lifecycle shared by every reduction.
pub trait ReductionOp: Send + Sync + fmt::Display {
    /// Per-pair formula; its dimension is the pair buffer length.
    fn formula(&self) -> &Formula;

    /// Index the output rows are indexed by.
    fn axis(&self) -> Axis;

    /// Accumulator length.
    fn dim_red(&self) -> usize;

    /// Output row length.
    fn dim(&self) -> usize;

    /// Write the neutral element.
    fn initialize<A: KernelFloat>(&self, acc: &mut [A]);

    /// Merge a pair result (or another accumulator of element type `T`) into `acc`.
    fn reduce_pair<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T]);

    /// Merge the pair result computed for inner index `j`.
    ///
    /// Same result as [`ReductionOp::reduce_pair`] for reductions that do not track
    /// indices.
    #[inline(always)]
    fn reduce_pair_short<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T], _j: usize) {
        self.reduce_pair(acc, xi);
    }

    /// Length of the compensation buffer used by [`ReductionOp::kahan_scheme`].
    fn kahan_dim(&self) -> usize;

    /// Compensated merge. `comp` starts zeroed and lives as long as `acc`.
    fn kahan_scheme<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T], comp: &mut [A]);

    /// Fold the pending compensation into the accumulator so it can be merged
    /// with plain [`ReductionOp::reduce_pair`].
    fn apply_compensation<A: KernelFloat>(&self, acc: &mut [A], comp: &[A]);

    /// Copy the accumulator into the output row. No post-processing.
    #[inline(always)]
    fn finalize_output<T: KernelFloat, A: Accumulate<T>>(&self, acc: &[A], out: &mut [T]) {
        for (o, &a) in out.iter_mut().zip(acc) {
            *o = a.demote();
        }
    }

    /// Reduction computing the vector-Jacobian product with respect to `v`.
    ///
    /// `gradin` is the upstream gradient (dimension [`ReductionOp::dim`]), `out`
    /// the forward output; both are variables indexed like this reduction's rows.
    fn gradient(&self, v: &Formula, gradin: &Formula, out: &Formula) -> ReductionResult<Reduction>;

    /// Identifier combining formula identity and direction.
    fn id(&self) -> String {
        self.to_string()
    }
}

/// The reductions a launch can run.
#[derive(Debug, Clone)]
pub enum Reduction {
    Sum(SumReduction),
    MaxSumShiftExp(MaxSumShiftExpReduction),
}

impl Reduction {
    /// Plain sum of `f` along `axis`.
    pub fn sum(f: Formula, axis: Axis) -> Self {
        Reduction::Sum(SumReduction::new(f, axis))
    }

    /// `(M, S) = (max_j f, Σ_j exp(f - M) · g)`; `f` must be scalar.
    pub fn max_sum_shift_exp(f: Formula, axis: Axis, g: Formula) -> ReductionResult<Self> {
        Ok(Reduction::MaxSumShiftExp(MaxSumShiftExpReduction::new(f, axis, g)?))
    }

    /// [`Reduction::max_sum_shift_exp`] with `g = 1`; `M + ln S` is the log-sum-exp.
    pub fn log_sum_exp(f: Formula, axis: Axis) -> ReductionResult<Self> {
        Ok(Reduction::MaxSumShiftExp(MaxSumShiftExpReduction::log_sum_exp(f, axis)?))
    }

    pub fn formula(&self) -> &Formula {
        match self {
            Reduction::Sum(op) => op.formula(),
            Reduction::MaxSumShiftExp(op) => op.formula(),
        }
    }

    pub fn axis(&self) -> Axis {
        match self {
            Reduction::Sum(op) => op.axis(),
            Reduction::MaxSumShiftExp(op) => op.axis(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Reduction::Sum(op) => op.dim(),
            Reduction::MaxSumShiftExp(op) => op.dim(),
        }
    }

    pub fn dim_red(&self) -> usize {
        match self {
            Reduction::Sum(op) => op.dim_red(),
            Reduction::MaxSumShiftExp(op) => op.dim_red(),
        }
    }

    pub fn id(&self) -> String {
        match self {
            Reduction::Sum(op) => op.id(),
            Reduction::MaxSumShiftExp(op) => op.id(),
        }
    }

    pub fn gradient(&self, v: &Formula, gradin: &Formula, out: &Formula) -> ReductionResult<Reduction> {
        match self {
            Reduction::Sum(op) => op.gradient(v, gradin, out),
            Reduction::MaxSumShiftExp(op) => op.gradient(v, gradin, out),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Sum(op) => fmt::Display::fmt(op, f),
            Reduction::MaxSumShiftExp(op) => fmt::Display::fmt(op, f),
        }
    }
}
