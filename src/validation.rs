//! Launch parameter validation for the host dispatcher.
//!
//! Everything here runs once per launch, before any pair is evaluated. Length
//! computations use `checked_mul` so absurd shapes fail instead of wrapping.

use crate::error::{ReductionError, ReductionResult};
use crate::formula::{Category, VarInfo};
use crate::kernel_dispatcher::Ranges;

/// Number of rows a variable of category `cat` holds.
#[inline]
pub fn rows_for(cat: Category, nx: usize, ny: usize) -> usize {
    match cat {
        Category::I => nx,
        Category::J => ny,
        Category::Param => 1,
    }
}

/// `rows * dim`, failing on overflow.
#[inline]
pub fn compute_buffer_len(rows: usize, dim: usize) -> ReductionResult<usize> {
    rows.checked_mul(dim).ok_or_else(|| {
        ReductionError::InvalidConfig(format!("buffer length {rows} x {dim} overflows usize"))
    })
}

/// Check that every referenced variable has a buffer of at least `rows(cat) * dim`.
pub fn validate_args<T>(vars: &[VarInfo], args: &[&[T]], nx: usize, ny: usize) -> ReductionResult<()> {
    for var in vars {
        let buf = args
            .get(var.index)
            .ok_or(ReductionError::MissingArgument(var.index))?;
        let expected = compute_buffer_len(rows_for(var.cat, nx, ny), var.dim)?;
        if buf.len() < expected {
            return Err(ReductionError::BufferLength {
                index: var.index,
                expected,
                actual: buf.len(),
            });
        }
    }
    Ok(())
}

/// The output buffer must hold exactly `n_out * dim` elements.
pub fn validate_output_len(actual: usize, n_out: usize, dim: usize) -> ReductionResult<()> {
    let expected = compute_buffer_len(n_out, dim)?;
    if actual != expected {
        return Err(ReductionError::OutputLength { expected, actual });
    }
    Ok(())
}

/// Block ranges must be well-formed and in bounds. Outer ranges cover each row at
/// most once, and the inner ranges of a block visit each index at most once.
pub fn validate_ranges(ranges: &Ranges, n_outer: usize, n_inner: usize) -> ReductionResult<()> {
    let mut outer: Vec<(usize, usize)> = Vec::with_capacity(ranges.blocks().len());
    for (b, block) in ranges.blocks().iter().enumerate() {
        let (start, end) = (block.outer.start, block.outer.end);
        if start > end || end > n_outer {
            return Err(ReductionError::InvalidRanges(format!(
                "block {b}: outer range {start}..{end} outside 0..{n_outer}"
            )));
        }
        let mut inner: Vec<(usize, usize)> = Vec::with_capacity(block.inner.len());
        for r in &block.inner {
            if r.start > r.end || r.end > n_inner {
                return Err(ReductionError::InvalidRanges(format!(
                    "block {b}: inner range {}..{} outside 0..{n_inner}",
                    r.start, r.end
                )));
            }
            inner.push((r.start, r.end));
        }
        check_disjoint(inner, &format!("block {b}: inner"))?;
        outer.push((start, end));
    }
    check_disjoint(outer, "outer")
}

/// Empty spans cover nothing and never overlap.
fn check_disjoint(mut spans: Vec<(usize, usize)>, what: &str) -> ReductionResult<()> {
    spans.retain(|&(start, end)| start < end);
    spans.sort_unstable();
    for w in spans.windows(2) {
        if w[1].0 < w[0].1 {
            return Err(ReductionError::InvalidRanges(format!(
                "{what} ranges {}..{} and {}..{} overlap",
                w[0].0, w[0].1, w[1].0, w[1].1
            )));
        }
    }
    Ok(())
}
