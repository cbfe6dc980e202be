//! Host reference dispatcher for pairwise reductions.
//!
//! Generic over the element type `T` and accumulator type `A`; compile-time
//! monomorphization per `(reduction, A, T)`, with the [`Reduction`] variant matched
//! once per launch.
//!
//! ## Buffer layout
//!
//! `args[k]` holds variable `k` row-major: `nx * dim` elements for [`Category::I`],
//! `ny * dim` for [`Category::J`], `dim` for [`Category::Param`]. Indices not
//! referenced by the formula may hold any slice. `out` holds one row of
//! `reduction.dim()` elements per output index (`nx` rows for [`Axis::I`], `ny` for
//! [`Axis::J`]).
//!
//! ## Work partitioning
//!
//! Each output row is reduced by exactly one task. With `chunk_size > 0` the inner
//! range of a row is split into chunks folded into partial accumulators, which are
//! then tree-merged with the full-form merge. With `parallel` set, rows are spread
//! over the rayon pool.

use std::ops::Range;

use rayon::prelude::*;

use crate::error::ReductionResult;
use crate::formula::{Axis, Category, VarInfo};
use crate::kernel_types::{Accumulate, KernelFloat, LaunchConfig, MergeScheme};
use crate::reductions::{Reduction, ReductionOp};
use crate::validation;

// =============================================================================
// Block-sparse ranges
// =============================================================================

/// A set of outer rows and the inner index ranges each of them reduces over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBlock {
    pub outer: Range<usize>,
    pub inner: Vec<Range<usize>>,
}

/// Block-sparse restriction of the pairwise grid.
///
/// Outer ranges must not overlap, nor may the inner ranges of one block. Rows
/// covered by no block produce the neutral element of the reduction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ranges {
    blocks: Vec<RangeBlock>,
}

impl Ranges {
    pub fn new(blocks: Vec<RangeBlock>) -> Self {
        Self { blocks }
    }

    /// Every outer row against every inner index.
    pub fn dense(n_outer: usize, n_inner: usize) -> Self {
        Self::new(vec![RangeBlock {
            outer: 0..n_outer,
            inner: vec![0..n_inner],
        }])
    }

    pub fn push(&mut self, block: RangeBlock) {
        self.blocks.push(block);
    }

    #[inline]
    pub fn blocks(&self) -> &[RangeBlock] {
        &self.blocks
    }

    /// Inner ranges per outer row. Assumes the ranges were validated.
    fn rows_inner(&self, n_outer: usize) -> Vec<&[Range<usize>]> {
        let mut rows = vec![<&[Range<usize>]>::default(); n_outer];
        for block in &self.blocks {
            for o in block.outer.clone() {
                rows[o] = &block.inner;
            }
        }
        rows
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// CPU reduction launcher.
///
/// ```ignore
/// let x = Formula::vi(0, 3);
/// let y = Formula::vj(1, 3);
/// let f = x.sub(&y)?.sqnorm2()?.neg();
/// let lse = Reduction::log_sum_exp(f, Axis::I)?;
///
/// let mut out = vec![0.0_f32; nx * lse.dim()];
/// KernelDispatcher::with_config(LaunchConfig::long_reduction())
///     .reduce::<f64, f32>(&lse, nx, ny, &[&xs, &ys], &mut out, None)?;
/// ```
#[derive(Debug, Clone)]
pub struct KernelDispatcher {
    config: LaunchConfig,
}

impl KernelDispatcher {
    /// Dispatcher configured from `PAIRWISE_KERNELS_*` environment variables.
    pub fn new() -> Self {
        Self::with_config(LaunchConfig::from_env())
    }

    pub fn with_config(config: LaunchConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run `reduction` over the `nx × ny` grid (restricted to `ranges` if given).
    ///
    /// Accumulates in `A`, writes the finalized rows to `out`. All shape errors are
    /// reported before any pair is evaluated.
    pub fn reduce<A, T>(
        &self,
        reduction: &Reduction,
        nx: usize,
        ny: usize,
        args: &[&[T]],
        out: &mut [T],
        ranges: Option<&Ranges>,
    ) -> ReductionResult<()>
    where
        A: Accumulate<T>,
        T: KernelFloat,
    {
        match reduction {
            Reduction::Sum(op) => self.launch::<_, A, T>(op, nx, ny, args, out, ranges),
            Reduction::MaxSumShiftExp(op) => self.launch::<_, A, T>(op, nx, ny, args, out, ranges),
        }
    }

    fn launch<Op, A, T>(
        &self,
        op: &Op,
        nx: usize,
        ny: usize,
        args: &[&[T]],
        out: &mut [T],
        ranges: Option<&Ranges>,
    ) -> ReductionResult<()>
    where
        Op: ReductionOp,
        A: Accumulate<T>,
        T: KernelFloat,
    {
        let vars = op.formula().variables()?;
        validation::validate_args(&vars, args, nx, ny)?;

        let (n_outer, n_inner) = match op.axis() {
            Axis::I => (nx, ny),
            Axis::J => (ny, nx),
        };
        let dim = op.dim();
        validation::validate_output_len(out.len(), n_outer, dim)?;

        let dense;
        let ranges = match ranges {
            Some(r) => {
                validation::validate_ranges(r, n_outer, n_inner)?;
                r
            }
            None => {
                dense = Ranges::dense(n_outer, n_inner);
                &dense
            }
        };
        let rows_inner = ranges.rows_inner(n_outer);

        log::debug!(
            "reduce {} [{}->{}] nx={} ny={} blocks={} merge={:?} chunk={} parallel={}",
            op.id(),
            T::TYPE_ID.name(),
            A::TYPE_ID.name(),
            nx,
            ny,
            ranges.blocks().len(),
            self.config.merge,
            self.config.chunk_size,
            self.config.parallel,
        );

        if dim == 0 || n_outer == 0 {
            return Ok(());
        }

        let ctx = PairContext {
            args,
            vars,
            axis: op.axis(),
        };
        let config = &self.config;

        if config.parallel {
            out.par_chunks_mut(dim).enumerate().for_each_init(
                || RowScratch::<A, T>::new(op, args.len()),
                |scratch, (o, out_row)| reduce_row(op, &ctx, config, o, rows_inner[o], scratch, out_row),
            );
        } else {
            let mut scratch = RowScratch::<A, T>::new(op, args.len());
            for (o, out_row) in out.chunks_mut(dim).enumerate() {
                reduce_row(op, &ctx, config, o, rows_inner[o], &mut scratch, out_row);
            }
        }
        Ok(())
    }
}

impl Default for KernelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CPU reference implementation
// =============================================================================

/// Per-launch view of the argument buffers.
struct PairContext<'a, T> {
    args: &'a [&'a [T]],
    vars: Vec<VarInfo>,
    axis: Axis,
}

impl<'a, T> PairContext<'a, T> {
    /// Point every referenced variable at its row for the pair `(outer, inner)`.
    #[inline]
    fn bind(&self, outer: usize, inner: usize, slots: &mut [&'a [T]]) {
        let (i, j) = match self.axis {
            Axis::I => (outer, inner),
            Axis::J => (inner, outer),
        };
        for v in &self.vars {
            let buf = self.args[v.index];
            slots[v.index] = match v.cat {
                Category::I => &buf[i * v.dim..(i + 1) * v.dim],
                Category::J => &buf[j * v.dim..(j + 1) * v.dim],
                Category::Param => &buf[..v.dim],
            };
        }
    }
}

/// Buffers reused across the rows handled by one worker.
struct RowScratch<'a, A, T> {
    acc: Vec<A>,
    /// Chunk partials of the current row, `dim_red` values each.
    partials: Vec<A>,
    pairs: PairScratch<'a, A, T>,
}

/// Per-pair buffers: bound argument rows, formula temporaries, the pair result and
/// the Kahan residuals.
struct PairScratch<'a, A, T> {
    slots: Vec<&'a [T]>,
    eval: Vec<T>,
    pair: Vec<T>,
    comp: Vec<A>,
}

impl<'a, A: KernelFloat, T: KernelFloat> RowScratch<'a, A, T> {
    fn new<Op: ReductionOp>(op: &Op, n_args: usize) -> Self {
        Self {
            acc: vec![A::zero(); op.dim_red()],
            partials: Vec::new(),
            pairs: PairScratch {
                slots: vec![<&[T]>::default(); n_args],
                eval: vec![T::zero(); op.formula().scratch_len()],
                pair: vec![T::zero(); op.formula().dim()],
                comp: vec![A::zero(); op.kahan_dim()],
            },
        }
    }
}

fn reduce_row<'a, Op, A, T>(
    op: &Op,
    ctx: &PairContext<'a, T>,
    config: &LaunchConfig,
    outer: usize,
    inner: &[Range<usize>],
    scratch: &mut RowScratch<'a, A, T>,
    out_row: &mut [T],
) where
    Op: ReductionOp,
    A: Accumulate<T>,
    T: KernelFloat,
{
    let indices = inner.iter().flat_map(|r| r.clone());

    if config.chunk_size == 0 {
        op.initialize(&mut scratch.acc);
        fold_pairs(op, ctx, config.merge, outer, indices, &mut scratch.acc, &mut scratch.pairs);
    } else {
        let dim_red = op.dim_red();
        scratch.partials.clear();
        let mut indices = indices.peekable();
        // Chunks are cut from the index stream, so none of them is empty.
        while indices.peek().is_some() {
            let base = scratch.partials.len();
            scratch.partials.resize(base + dim_red, A::zero());
            let partial = &mut scratch.partials[base..];
            op.initialize(partial);
            fold_pairs(
                op,
                ctx,
                config.merge,
                outer,
                indices.by_ref().take(config.chunk_size),
                partial,
                &mut scratch.pairs,
            );
        }

        if scratch.partials.len() > dim_red {
            log::trace!(
                "row {outer}: tree-merging {} partial accumulators",
                scratch.partials.len() / dim_red
            );
        }
        match tree_merge(op, &mut scratch.partials, dim_red) {
            Some(acc) => scratch.acc.copy_from_slice(acc),
            None => op.initialize(&mut scratch.acc),
        }
    }

    op.finalize_output(&scratch.acc, out_row);
}

/// Evaluate and merge every pair `(outer, j)` for `j` in `indices` into `acc`.
#[inline]
fn fold_pairs<'a, Op, A, T>(
    op: &Op,
    ctx: &PairContext<'a, T>,
    scheme: MergeScheme,
    outer: usize,
    indices: impl Iterator<Item = usize>,
    acc: &mut [A],
    scratch: &mut PairScratch<'a, A, T>,
) where
    Op: ReductionOp,
    A: Accumulate<T>,
    T: KernelFloat,
{
    let formula = op.formula();
    let PairScratch { slots, eval, pair, comp } = scratch;
    match scheme {
        MergeScheme::Plain => {
            for j in indices {
                ctx.bind(outer, j, slots);
                formula.eval_in(slots, pair, eval);
                op.reduce_pair_short(acc, pair, j);
            }
        }
        MergeScheme::Kahan => {
            comp.fill(A::zero());
            for j in indices {
                ctx.bind(outer, j, slots);
                formula.eval_in(slots, pair, eval);
                op.kahan_scheme(acc, pair, comp);
            }
            op.apply_compensation(acc, comp);
        }
    }
}

/// Pairwise tree merge, in place, of the `dim_red`-sized partials packed in
/// `partials`. Returns the merged accumulator, or `None` when there are no partials.
fn tree_merge<'p, Op, A>(op: &Op, partials: &'p mut [A], dim_red: usize) -> Option<&'p [A]>
where
    Op: ReductionOp,
    A: KernelFloat,
{
    if dim_red == 0 || partials.len() < dim_red {
        return None;
    }
    let n = partials.len() / dim_red;
    let mut width = 1;
    while width < n {
        let mut k = 0;
        while k + width < n {
            let (left, right) = partials.split_at_mut((k + width) * dim_red);
            op.reduce_pair::<A, A>(&mut left[k * dim_red..(k + 1) * dim_red], &right[..dim_red]);
            k += 2 * width;
        }
        width *= 2;
    }
    Some(&partials[..dim_red])
}
