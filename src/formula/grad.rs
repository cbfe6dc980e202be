//! Symbolic vector-Jacobian products.
//!
//! `f.grad(v, gradin)` builds a new formula of dimension `dim(v)` equal to
//! `(∂f/∂v)ᵀ · gradin`. The input tree is never mutated; the result shares every
//! subtree it reuses (e.g. the gradient of `Exp(a)` references the same `Exp` node).

use super::{Formula, Node, VarInfo};
use crate::error::{ReductionError, ReductionResult};

impl Formula {
    /// Vector-Jacobian product of `self` with respect to variable `v`.
    ///
    /// `gradin` must have the dimension of `self`; `v` must be a bare variable.
    pub fn grad(&self, v: &Formula, gradin: &Formula) -> ReductionResult<Formula> {
        let target = v
            .as_var()
            .ok_or_else(|| ReductionError::NotAVariable(v.to_string()))?;
        if gradin.dim() != self.dim() {
            return Err(ReductionError::DimensionMismatch {
                op: "grad",
                left: self.dim(),
                right: gradin.dim(),
            });
        }
        self.vjp(&target, gradin)
    }

    /// True when `v` appears anywhere in the tree.
    pub fn depends_on(&self, v: &VarInfo) -> bool {
        match self.node() {
            Node::Var { index, dim, cat } => {
                *index == v.index && *dim == v.dim && *cat == v.cat
            }
            Node::Zero { .. } | Node::IntConstant(_) => false,
            Node::Extract { arg, .. }
            | Node::ExtractT { arg, .. }
            | Node::Minus(arg)
            | Node::Exp(arg)
            | Node::Log(arg)
            | Node::Sum(arg)
            | Node::SumT(arg) => arg.depends_on(v),
            Node::Concat(a, b)
            | Node::Add(a, b)
            | Node::Subtract(a, b)
            | Node::Mult(a, b)
            | Node::Divide(a, b)
            | Node::Scal(a, b) => a.depends_on(v) || b.depends_on(v),
        }
    }

    fn vjp(&self, v: &VarInfo, gradin: &Formula) -> ReductionResult<Formula> {
        if !self.depends_on(v) {
            return Ok(Formula::zero(v.dim));
        }
        match self.node() {
            // depends_on() guarantees this is the target.
            Node::Var { .. } => Ok(gradin.clone()),
            Node::Zero { .. } | Node::IntConstant(_) => Ok(Formula::zero(v.dim)),
            Node::Extract { arg, start } => arg.vjp(v, &gradin.extract_t(*start, arg.dim())?),
            Node::ExtractT { arg, start } => arg.vjp(v, &gradin.extract(*start, arg.dim())?),
            Node::Concat(a, b) => {
                let ga = a.vjp(v, &gradin.extract(0, a.dim())?)?;
                let gb = b.vjp(v, &gradin.extract(a.dim(), b.dim())?)?;
                ga.add(&gb)
            }
            Node::Add(a, b) => {
                let ga = a.vjp(v, &unbroadcast(gradin, a.dim()))?;
                let gb = b.vjp(v, &unbroadcast(gradin, b.dim()))?;
                ga.add(&gb)
            }
            Node::Subtract(a, b) => {
                let ga = a.vjp(v, &unbroadcast(gradin, a.dim()))?;
                let gb = b.vjp(v, &unbroadcast(gradin, b.dim()))?;
                ga.sub(&gb)
            }
            Node::Mult(a, b) => {
                let ga = a.vjp(v, &unbroadcast(&b.mul(gradin)?, a.dim()))?;
                let gb = b.vjp(v, &unbroadcast(&a.mul(gradin)?, b.dim()))?;
                ga.add(&gb)
            }
            Node::Divide(a, b) => {
                // d(a/b) = da/b - a·db/b²
                let ga = a.vjp(v, &unbroadcast(&gradin.div(b)?, a.dim()))?;
                let scaled = a.mul(gradin)?.div(&b.mul(b)?)?;
                let gb = b.vjp(v, &unbroadcast(&scaled, b.dim()))?;
                ga.sub(&gb)
            }
            Node::Scal(a, b) => {
                let ga = a.vjp(v, &b.mul(gradin)?.sum())?;
                let gb = b.vjp(v, &a.scal(gradin)?)?;
                ga.add(&gb)
            }
            Node::Minus(a) => Ok(a.vjp(v, gradin)?.neg()),
            Node::Exp(a) => a.vjp(v, &self.mul(gradin)?),
            Node::Log(a) => a.vjp(v, &gradin.div(a)?),
            Node::Sum(a) => a.vjp(v, &gradin.broadcast(a.dim())?),
            Node::SumT(a) => a.vjp(v, &gradin.sum()),
        }
    }
}

/// Fold a gradient back onto an operand that was broadcast from dimension 1.
fn unbroadcast(g: &Formula, dim: usize) -> Formula {
    if g.dim() == dim {
        g.clone()
    } else {
        g.sum()
    }
}
