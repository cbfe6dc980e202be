//! Plain summation along one axis.

use std::fmt;

use super::{Reduction, ReductionOp};
use crate::error::{ReductionError, ReductionResult};
use crate::formula::{Axis, Formula};
use crate::kernel_types::{Accumulate, KernelFloat};
use crate::ops::stable_accumulator::kahan_add;

/// `out_i = Σ_j f_ij` (or over `i` for [`Axis::J`]).
#[derive(Debug, Clone)]
pub struct SumReduction {
    formula: Formula,
    axis: Axis,
}

impl SumReduction {
    pub fn new(formula: Formula, axis: Axis) -> Self {
        Self { formula, axis }
    }
}

impl ReductionOp for SumReduction {
    fn formula(&self) -> &Formula {
        &self.formula
    }

    fn axis(&self) -> Axis {
        self.axis
    }

    fn dim_red(&self) -> usize {
        self.formula.dim()
    }

    fn dim(&self) -> usize {
        self.formula.dim()
    }

    #[inline(always)]
    fn initialize<A: KernelFloat>(&self, acc: &mut [A]) {
        acc.fill(A::zero());
    }

    #[inline(always)]
    fn reduce_pair<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T]) {
        for (a, &x) in acc.iter_mut().zip(xi) {
            *a = *a + A::promote(x);
        }
    }

    fn kahan_dim(&self) -> usize {
        self.formula.dim()
    }

    #[inline(always)]
    fn kahan_scheme<T: KernelFloat, A: Accumulate<T>>(&self, acc: &mut [A], xi: &[T], comp: &mut [A]) {
        for ((a, c), &x) in acc.iter_mut().zip(comp.iter_mut()).zip(xi) {
            kahan_add(a, c, A::promote(x));
        }
    }

    fn apply_compensation<A: KernelFloat>(&self, acc: &mut [A], comp: &[A]) {
        for (a, &c) in acc.iter_mut().zip(comp) {
            *a = *a - c;
        }
    }

    /// `Sum(∂f/∂v · gradin)` indexed like `v`.
    fn gradient(&self, v: &Formula, gradin: &Formula, _out: &Formula) -> ReductionResult<Reduction> {
        let target = v
            .as_var()
            .ok_or_else(|| ReductionError::NotAVariable(v.to_string()))?;
        let grad = self.formula.grad(v, gradin)?;
        Ok(Reduction::Sum(SumReduction::new(grad, target.cat.gradient_axis())))
    }
}

impl fmt::Display for SumReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sum(f={},axis={})", self.formula, self.axis)
    }
}
