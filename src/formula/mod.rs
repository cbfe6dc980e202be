//! Per-pair formula trees.
//!
//! A [`Formula`] describes the numeric computation performed for one `(i, j)` pair.
//! Nodes are immutable and shared through `Arc`, so composing a formula from an
//! existing one never copies the subtree. Every node knows its output dimension;
//! constructors reject inconsistent dimensions when the tree is built.
//!
//! This is deliberately small: the node kinds the reductions and their gradients
//! need, a reference evaluator, and symbolic vector-Jacobian products ([`grad`]).

pub mod grad;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ReductionError, ReductionResult};
use crate::kernel_types::KernelFloat;

// ── Index categories ───────────────────────────────────────────────

/// How a variable is indexed across the pairwise grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// One row per `i` (row-indexed).
    I,
    /// One row per `j` (column-indexed).
    J,
    /// Shared by every pair.
    Param,
}

impl Category {
    /// Output axis of a gradient taken with respect to a variable of this category.
    ///
    /// Parameters map to [`Axis::I`]: the resulting reduction yields one partial
    /// gradient per `i`, and summing those partials is left to the caller.
    pub const fn gradient_axis(self) -> Axis {
        match self {
            Category::I | Category::Param => Axis::I,
            Category::J => Axis::J,
        }
    }

    fn tag(self) -> char {
        match self {
            Category::I => 'i',
            Category::J => 'j',
            Category::Param => 'p',
        }
    }
}

/// The index a reduction's output is indexed by. The reduction runs over the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// One output row per `i`; reduces over `j`.
    I,
    /// One output row per `j`; reduces over `i`.
    J,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::I => write!(f, "i"),
            Axis::J => write!(f, "j"),
        }
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// Expression node. Children are [`Formula`] handles.
#[derive(Debug, PartialEq)]
pub enum Node {
    Var { index: usize, dim: usize, cat: Category },
    Zero { dim: usize },
    IntConstant(i32),
    /// `arg[start..start+dim]`
    Extract { arg: Formula, start: usize },
    /// Zero vector of the node's dimension with `arg` written at `start`.
    ExtractT { arg: Formula, start: usize },
    Concat(Formula, Formula),
    Add(Formula, Formula),
    Subtract(Formula, Formula),
    /// Elementwise product; a dimension-1 operand broadcasts.
    Mult(Formula, Formula),
    /// Elementwise quotient; a dimension-1 operand broadcasts.
    Divide(Formula, Formula),
    /// Scalar times vector.
    Scal(Formula, Formula),
    Minus(Formula),
    Exp(Formula),
    Log(Formula),
    /// Sum of all components.
    Sum(Formula),
    /// Scalar broadcast to the node's dimension.
    SumT(Formula),
}

/// Shared handle to an immutable formula node with a cached output dimension.
#[derive(Clone, PartialEq)]
pub struct Formula {
    node: Arc<Node>,
    dim: usize,
    /// Temporary values needed by [`Formula::eval_in`].
    scratch: usize,
}

/// A variable referenced by a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub index: usize,
    pub dim: usize,
    pub cat: Category,
}

fn broadcast_dim(op: &'static str, a: usize, b: usize) -> ReductionResult<usize> {
    if a == b || b == 1 {
        Ok(a)
    } else if a == 1 {
        Ok(b)
    } else {
        Err(ReductionError::DimensionMismatch { op, left: a, right: b })
    }
}

impl Formula {
    fn from_node(node: Node, dim: usize) -> Self {
        let scratch = node.scratch_len(dim);
        Self { node: Arc::new(node), dim, scratch }
    }

    // ── Leaves ──

    /// Input variable `index` of dimension `dim`.
    pub fn var(index: usize, dim: usize, cat: Category) -> Self {
        Self::from_node(Node::Var { index, dim, cat }, dim)
    }

    /// Row-indexed variable.
    pub fn vi(index: usize, dim: usize) -> Self {
        Self::var(index, dim, Category::I)
    }

    /// Column-indexed variable.
    pub fn vj(index: usize, dim: usize) -> Self {
        Self::var(index, dim, Category::J)
    }

    /// Parameter shared by every pair.
    pub fn param(index: usize, dim: usize) -> Self {
        Self::var(index, dim, Category::Param)
    }

    pub fn zero(dim: usize) -> Self {
        Self::from_node(Node::Zero { dim }, dim)
    }

    pub fn int(value: i32) -> Self {
        Self::from_node(Node::IntConstant(value), 1)
    }

    // ── Accessors ──

    /// Output dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_zero(&self) -> bool {
        matches!(*self.node, Node::Zero { .. })
    }

    /// `Some` when this formula is a bare variable.
    pub fn as_var(&self) -> Option<VarInfo> {
        match *self.node {
            Node::Var { index, dim, cat } => Some(VarInfo { index, dim, cat }),
            _ => None,
        }
    }

    /// True when both handles point at the same node.
    pub fn ptr_eq(&self, other: &Formula) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    // ── Composition ──

    /// Components `[start, start + dim)`.
    pub fn extract(&self, start: usize, dim: usize) -> ReductionResult<Formula> {
        if start + dim > self.dim {
            return Err(ReductionError::ExtractOutOfRange { start, dim, arg_dim: self.dim });
        }
        if start == 0 && dim == self.dim {
            return Ok(self.clone());
        }
        if self.is_zero() {
            return Ok(Formula::zero(dim));
        }
        Ok(Self::from_node(Node::Extract { arg: self.clone(), start }, dim))
    }

    /// Embed `self` at `start` inside a zero vector of dimension `dim`.
    pub fn extract_t(&self, start: usize, dim: usize) -> ReductionResult<Formula> {
        if start + self.dim > dim {
            return Err(ReductionError::ExtractOutOfRange { start, dim: self.dim, arg_dim: dim });
        }
        if start == 0 && dim == self.dim {
            return Ok(self.clone());
        }
        if self.is_zero() {
            return Ok(Formula::zero(dim));
        }
        Ok(Self::from_node(Node::ExtractT { arg: self.clone(), start }, dim))
    }

    pub fn concat(&self, other: &Formula) -> Formula {
        let dim = self.dim + other.dim;
        if self.is_zero() && other.is_zero() {
            return Formula::zero(dim);
        }
        Self::from_node(Node::Concat(self.clone(), other.clone()), dim)
    }

    /// Broadcast a dimension-1 formula to `dim` components (identity when dims match).
    pub fn broadcast(&self, dim: usize) -> ReductionResult<Formula> {
        if self.dim == dim {
            return Ok(self.clone());
        }
        if self.dim != 1 {
            return Err(ReductionError::DimensionMismatch { op: "broadcast", left: self.dim, right: dim });
        }
        if self.is_zero() {
            return Ok(Formula::zero(dim));
        }
        Ok(Self::from_node(Node::SumT(self.clone()), dim))
    }

    pub fn add(&self, other: &Formula) -> ReductionResult<Formula> {
        let dim = broadcast_dim("add", self.dim, other.dim)?;
        if self.is_zero() {
            return other.broadcast(dim);
        }
        if other.is_zero() {
            return self.broadcast(dim);
        }
        Ok(Self::from_node(Node::Add(self.clone(), other.clone()), dim))
    }

    pub fn sub(&self, other: &Formula) -> ReductionResult<Formula> {
        let dim = broadcast_dim("subtract", self.dim, other.dim)?;
        if self.is_zero() {
            return Ok(other.broadcast(dim)?.neg());
        }
        if other.is_zero() {
            return self.broadcast(dim);
        }
        Ok(Self::from_node(Node::Subtract(self.clone(), other.clone()), dim))
    }

    pub fn mul(&self, other: &Formula) -> ReductionResult<Formula> {
        let dim = broadcast_dim("mult", self.dim, other.dim)?;
        if self.is_zero() || other.is_zero() {
            return Ok(Formula::zero(dim));
        }
        Ok(Self::from_node(Node::Mult(self.clone(), other.clone()), dim))
    }

    pub fn div(&self, other: &Formula) -> ReductionResult<Formula> {
        let dim = broadcast_dim("divide", self.dim, other.dim)?;
        if self.is_zero() {
            return Ok(Formula::zero(dim));
        }
        Ok(Self::from_node(Node::Divide(self.clone(), other.clone()), dim))
    }

    /// `self * other` where `self` is a scalar.
    pub fn scal(&self, other: &Formula) -> ReductionResult<Formula> {
        if self.dim != 1 {
            return Err(ReductionError::DimensionMismatch { op: "scal", left: self.dim, right: 1 });
        }
        if self.is_zero() || other.is_zero() {
            return Ok(Formula::zero(other.dim));
        }
        Ok(Self::from_node(Node::Scal(self.clone(), other.clone()), other.dim))
    }

    pub fn neg(&self) -> Formula {
        match &*self.node {
            Node::Zero { .. } => self.clone(),
            Node::Minus(inner) => inner.clone(),
            _ => Self::from_node(Node::Minus(self.clone()), self.dim),
        }
    }

    pub fn exp(&self) -> Formula {
        Self::from_node(Node::Exp(self.clone()), self.dim)
    }

    pub fn log(&self) -> Formula {
        Self::from_node(Node::Log(self.clone()), self.dim)
    }

    pub fn sum(&self) -> Formula {
        if self.is_zero() {
            return Formula::zero(1);
        }
        if self.dim == 1 {
            return self.clone();
        }
        Self::from_node(Node::Sum(self.clone()), 1)
    }

    /// Squared Euclidean norm.
    pub fn sqnorm2(&self) -> ReductionResult<Formula> {
        Ok(self.mul(self)?.sum())
    }

    // ── Inspection ──

    /// Distinct variables referenced by the formula, sorted by index.
    pub fn variables(&self) -> ReductionResult<Vec<VarInfo>> {
        let mut seen = BTreeMap::new();
        self.collect_vars(&mut seen)?;
        Ok(seen.into_values().collect())
    }

    fn collect_vars(&self, seen: &mut BTreeMap<usize, VarInfo>) -> ReductionResult<()> {
        match &*self.node {
            Node::Var { index, dim, cat } => {
                let info = VarInfo { index: *index, dim: *dim, cat: *cat };
                if let Some(prev) = seen.get(index) {
                    if *prev != info {
                        return Err(ReductionError::ConflictingVariable {
                            index: *index,
                            first: format!("{prev:?}"),
                            second: format!("{info:?}"),
                        });
                    }
                } else {
                    seen.insert(*index, info);
                }
                Ok(())
            }
            Node::Zero { .. } | Node::IntConstant(_) => Ok(()),
            Node::Extract { arg, .. }
            | Node::ExtractT { arg, .. }
            | Node::Minus(arg)
            | Node::Exp(arg)
            | Node::Log(arg)
            | Node::Sum(arg)
            | Node::SumT(arg) => arg.collect_vars(seen),
            Node::Concat(a, b)
            | Node::Add(a, b)
            | Node::Subtract(a, b)
            | Node::Mult(a, b)
            | Node::Divide(a, b)
            | Node::Scal(a, b) => {
                a.collect_vars(seen)?;
                b.collect_vars(seen)
            }
        }
    }

    // ── Evaluation ──

    /// Length of the scratch buffer [`Formula::eval_in`] needs.
    #[inline]
    pub fn scratch_len(&self) -> usize {
        self.scratch
    }

    /// Evaluate the formula for one pair.
    ///
    /// `args[k]` holds the components of variable `k` for this pair (at least its
    /// dimension); `out` receives exactly `self.dim()` values. Arithmetic follows
    /// IEEE semantics of `T` with no sanitizing. Allocates its scratch; hot loops use
    /// [`Formula::eval_in`].
    pub fn eval<T: KernelFloat>(&self, args: &[&[T]], out: &mut [T]) {
        let mut scratch = vec![T::zero(); self.scratch];
        self.eval_in(args, out, &mut scratch);
    }

    /// [`Formula::eval`] with caller-provided scratch of at least
    /// [`Formula::scratch_len`] values. Each node takes its temporaries from the
    /// front of `scratch` and hands the rest to its children.
    pub fn eval_in<T: KernelFloat>(&self, args: &[&[T]], out: &mut [T], scratch: &mut [T]) {
        debug_assert_eq!(out.len(), self.dim);
        debug_assert!(scratch.len() >= self.scratch);
        match &*self.node {
            Node::Var { index, dim, .. } => out.copy_from_slice(&args[*index][..*dim]),
            Node::Zero { .. } => out.fill(T::zero()),
            Node::IntConstant(v) => out[0] = T::splat(*v as f64),
            Node::Extract { arg, start } => {
                let (tmp, rest) = scratch.split_at_mut(arg.dim);
                arg.eval_in(args, tmp, rest);
                out.copy_from_slice(&tmp[*start..*start + self.dim]);
            }
            Node::ExtractT { arg, start } => {
                out.fill(T::zero());
                arg.eval_in(args, &mut out[*start..*start + arg.dim], scratch);
            }
            Node::Concat(a, b) => {
                let (head, tail) = out.split_at_mut(a.dim);
                a.eval_in(args, head, scratch);
                b.eval_in(args, tail, scratch);
            }
            Node::Add(a, b) => eval_binary(a, b, args, out, scratch, |x, y| x + y),
            Node::Subtract(a, b) => eval_binary(a, b, args, out, scratch, |x, y| x - y),
            Node::Mult(a, b) | Node::Scal(a, b) => eval_binary(a, b, args, out, scratch, |x, y| x * y),
            Node::Divide(a, b) => eval_binary(a, b, args, out, scratch, |x, y| x / y),
            Node::Minus(a) => {
                a.eval_in(args, out, scratch);
                for o in out.iter_mut() {
                    *o = -*o;
                }
            }
            Node::Exp(a) => {
                a.eval_in(args, out, scratch);
                for o in out.iter_mut() {
                    *o = o.exp();
                }
            }
            Node::Log(a) => {
                a.eval_in(args, out, scratch);
                for o in out.iter_mut() {
                    *o = o.ln();
                }
            }
            Node::Sum(a) => {
                let (tmp, rest) = scratch.split_at_mut(a.dim);
                a.eval_in(args, tmp, rest);
                out[0] = tmp.iter().fold(T::zero(), |acc, &x| acc + x);
            }
            Node::SumT(a) => {
                let (tmp, rest) = scratch.split_at_mut(1);
                a.eval_in(args, tmp, rest);
                out.fill(tmp[0]);
            }
        }
    }
}

impl Node {
    /// Scratch needed to evaluate this node with output dimension `dim`.
    fn scratch_len(&self, dim: usize) -> usize {
        match self {
            Node::Var { .. } | Node::Zero { .. } | Node::IntConstant(_) => 0,
            Node::Extract { arg, .. } => arg.dim + arg.scratch,
            Node::ExtractT { arg, .. } | Node::Minus(arg) | Node::Exp(arg) | Node::Log(arg) => arg.scratch,
            Node::Concat(a, b) => a.scratch.max(b.scratch),
            Node::Add(a, b)
            | Node::Subtract(a, b)
            | Node::Mult(a, b)
            | Node::Divide(a, b)
            | Node::Scal(a, b) => {
                let tmp = if a.dim == dim { b.dim } else { a.dim };
                tmp + a.scratch.max(b.scratch)
            }
            Node::Sum(a) => a.dim + a.scratch,
            Node::SumT(a) => 1 + a.scratch,
        }
    }
}

/// Elementwise `op` with a dimension-1 operand broadcast. The full-width operand is
/// evaluated straight into `out`, the other one into scratch.
fn eval_binary<T: KernelFloat>(
    a: &Formula,
    b: &Formula,
    args: &[&[T]],
    out: &mut [T],
    scratch: &mut [T],
    op: impl Fn(T, T) -> T,
) {
    if a.dim == out.len() {
        let (rhs, rest) = scratch.split_at_mut(b.dim);
        a.eval_in(args, out, rest);
        b.eval_in(args, rhs, rest);
        for (k, o) in out.iter_mut().enumerate() {
            let y = if b.dim == 1 { rhs[0] } else { rhs[k] };
            *o = op(*o, y);
        }
    } else {
        let (lhs, rest) = scratch.split_at_mut(a.dim);
        b.eval_in(args, out, rest);
        a.eval_in(args, lhs, rest);
        for o in out.iter_mut() {
            *o = op(lhs[0], *o);
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.node {
            Node::Var { index, dim, cat } => write!(f, "Var({index},{dim},{})", cat.tag()),
            Node::Zero { dim } => write!(f, "Zero({dim})"),
            Node::IntConstant(v) => write!(f, "{v}"),
            Node::Extract { arg, start } => write!(f, "Extract({arg},{start},{})", self.dim),
            Node::ExtractT { arg, start } => write!(f, "ExtractT({arg},{start},{})", self.dim),
            Node::Concat(a, b) => write!(f, "Concat({a},{b})"),
            Node::Add(a, b) => write!(f, "({a}+{b})"),
            Node::Subtract(a, b) => write!(f, "({a}-{b})"),
            Node::Mult(a, b) => write!(f, "({a}*{b})"),
            Node::Divide(a, b) => write!(f, "({a}/{b})"),
            Node::Scal(a, b) => write!(f, "Scal({a},{b})"),
            Node::Minus(a) => write!(f, "-{a}"),
            Node::Exp(a) => write!(f, "Exp({a})"),
            Node::Log(a) => write!(f, "Log({a})"),
            Node::Sum(a) => write!(f, "Sum({a})"),
            Node::SumT(a) => write!(f, "SumT({a},{})", self.dim),
        }
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Formula[{}]({self})", self.dim)
    }
}
