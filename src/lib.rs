//! pairwise-kernels: stable pairwise reductions on the host.
//!
//! This crate evaluates a per-pair formula `f(x_i, y_j)` over a row × column grid
//! and folds the results along one index with a numerically stable reduction:
//! - **Max-Shift-Exp Reduction**: online `(max, shifted sum)` accumulation behind
//!   log-sum-exp and softmax-weighted sums, without overflow
//! - **Compensated Merge**: Kahan variant selected per launch for very long rows
//! - **Symbolic Gradients**: backward passes are new reductions built from the
//!   forward formula tree
//! - **Zero-Cost Generics**: element and accumulator types resolved at compile time
//!   (`f32`, `f64`, `half::f16`, `half::bf16`, packed [`Half2`])
//!
//! # Quick Start
//!
//! ```ignore
//! use pairwise_kernels::{Axis, Formula, KernelDispatcher, LaunchConfig, Reduction};
//!
//! let x = Formula::vi(0, 3);
//! let y = Formula::vj(1, 3);
//! let lse = Reduction::log_sum_exp(x.sub(&y)?.sqnorm2()?.neg(), Axis::I)?;
//!
//! let mut out = vec![0.0_f32; nx * lse.dim()];
//! KernelDispatcher::with_config(LaunchConfig::long_reduction())
//!     .reduce::<f64, f32>(&lse, nx, ny, &[&xs, &ys], &mut out, None)?;
//! let log_sum_exp = pairwise_kernels::ops::softmax::log_sum_exp_rows(&out)?;
//! ```

pub mod error;
pub mod formula;
pub mod kernel_types;
pub mod ops;
pub mod reductions;
pub mod validation;

// Host reference dispatcher
pub mod kernel_dispatcher;

pub use error::{ReductionError, ReductionResult};
pub use formula::{Axis, Category, Formula, Node, VarInfo};
pub use kernel_dispatcher::{KernelDispatcher, RangeBlock, Ranges};
pub use kernel_types::{Accumulate, FloatType, Half2, KernelFloat, LaunchConfig, MergeScheme};
pub use reductions::{MaxSumShiftExpReduction, Reduction, ReductionOp, SumReduction};

// Post-processing exports
pub use ops::softmax::{
    log_sum_exp_rows, lse_upstream_gradient, softmax_upstream_gradient, softmax_weight_rows,
    sum_softmax_weight,
};
pub use ops::stable_accumulator::{kahan_add, KahanAccumulator};
