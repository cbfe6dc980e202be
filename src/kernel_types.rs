//! Element types and launch configuration shared by reductions and the dispatcher.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::ReductionResult;

/// Element type tag, used in launch diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatType {
    F32,
    F64,
    F16,
    BF16,
    /// Two packed `f16` lanes processed in lock-step.
    Half2,
}

impl FloatType {
    /// Short name used in kernel identifiers.
    pub const fn name(self) -> &'static str {
        match self {
            FloatType::F32 => "f32",
            FloatType::F64 => "f64",
            FloatType::F16 => "f16",
            FloatType::BF16 => "bf16",
            FloatType::Half2 => "half2",
        }
    }
}

/// Trait for kernel-compatible floating point types.
///
/// Implemented for `f32`, `f64`, `half::f16`, `half::bf16` and the packed [`Half2`].
/// All operations are lane-wise; scalar types have a single lane. Zero-cost via
/// monomorphization.
pub trait KernelFloat:
    Copy
    + Default
    + Debug
    + PartialEq
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    /// Compile-time type identifier for zero-cost kernel selection.
    const TYPE_ID: FloatType;
    /// Number of independent lanes packed in one value.
    const LANES: usize;

    fn zero() -> Self;
    fn one() -> Self;
    /// Neutral element of `max`: `-inf` where representable, otherwise the most
    /// negative finite value of the encoding.
    fn neg_limit() -> Self;
    /// Broadcast a constant to every lane.
    fn splat(v: f64) -> Self;
    /// Read one lane as `f64`.
    fn lane(self, i: usize) -> f64;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    /// Lane-wise `if a > b { if_gt } else { otherwise }`.
    fn select_gt(a: Self, b: Self, if_gt: Self, otherwise: Self) -> Self;
}

impl KernelFloat for f32 {
    const TYPE_ID: FloatType = FloatType::F32;
    const LANES: usize = 1;

    #[inline(always)]
    fn zero() -> Self { 0.0 }
    #[inline(always)]
    fn one() -> Self { 1.0 }
    #[inline(always)]
    fn neg_limit() -> Self { f32::NEG_INFINITY }
    #[inline(always)]
    fn splat(v: f64) -> Self { v as f32 }
    #[inline(always)]
    fn lane(self, _i: usize) -> f64 { self as f64 }
    #[inline(always)]
    fn exp(self) -> Self { f32::exp(self) }
    #[inline(always)]
    fn ln(self) -> Self { f32::ln(self) }
    #[inline(always)]
    fn select_gt(a: Self, b: Self, if_gt: Self, otherwise: Self) -> Self {
        if a > b { if_gt } else { otherwise }
    }
}

impl KernelFloat for f64 {
    const TYPE_ID: FloatType = FloatType::F64;
    const LANES: usize = 1;

    #[inline(always)]
    fn zero() -> Self { 0.0 }
    #[inline(always)]
    fn one() -> Self { 1.0 }
    #[inline(always)]
    fn neg_limit() -> Self { f64::NEG_INFINITY }
    #[inline(always)]
    fn splat(v: f64) -> Self { v }
    #[inline(always)]
    fn lane(self, _i: usize) -> f64 { self }
    #[inline(always)]
    fn exp(self) -> Self { f64::exp(self) }
    #[inline(always)]
    fn ln(self) -> Self { f64::ln(self) }
    #[inline(always)]
    fn select_gt(a: Self, b: Self, if_gt: Self, otherwise: Self) -> Self {
        if a > b { if_gt } else { otherwise }
    }
}

impl KernelFloat for f16 {
    const TYPE_ID: FloatType = FloatType::F16;
    const LANES: usize = 1;

    #[inline(always)]
    fn zero() -> Self { f16::ZERO }
    #[inline(always)]
    fn one() -> Self { f16::ONE }
    // -65504, matching what device half kernels can load without an inf literal.
    #[inline(always)]
    fn neg_limit() -> Self { f16::MIN }
    #[inline(always)]
    fn splat(v: f64) -> Self { f16::from_f64(v) }
    #[inline(always)]
    fn lane(self, _i: usize) -> f64 { self.to_f64() }
    #[inline(always)]
    fn exp(self) -> Self { f16::from_f32(self.to_f32().exp()) }
    #[inline(always)]
    fn ln(self) -> Self { f16::from_f32(self.to_f32().ln()) }
    #[inline(always)]
    fn select_gt(a: Self, b: Self, if_gt: Self, otherwise: Self) -> Self {
        if a.to_f32() > b.to_f32() { if_gt } else { otherwise }
    }
}

impl KernelFloat for bf16 {
    const TYPE_ID: FloatType = FloatType::BF16;
    const LANES: usize = 1;

    #[inline(always)]
    fn zero() -> Self { bf16::ZERO }
    #[inline(always)]
    fn one() -> Self { bf16::ONE }
    #[inline(always)]
    fn neg_limit() -> Self { bf16::NEG_INFINITY }
    #[inline(always)]
    fn splat(v: f64) -> Self { bf16::from_f64(v) }
    #[inline(always)]
    fn lane(self, _i: usize) -> f64 { self.to_f64() }
    #[inline(always)]
    fn exp(self) -> Self { bf16::from_f32(self.to_f32().exp()) }
    #[inline(always)]
    fn ln(self) -> Self { bf16::from_f32(self.to_f32().ln()) }
    #[inline(always)]
    fn select_gt(a: Self, b: Self, if_gt: Self, otherwise: Self) -> Self {
        if a.to_f32() > b.to_f32() { if_gt } else { otherwise }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Packed half pair
// ────────────────────────────────────────────────────────────────────────────

/// Two `f16` lanes carried and computed together.
///
/// Each lane belongs to an independent pair evaluation, so comparisons never
/// branch: [`KernelFloat::select_gt`] blends lane by lane.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Half2(pub [f16; 2]);

impl Half2 {
    #[inline(always)]
    pub const fn new(lo: f16, hi: f16) -> Self {
        Self([lo, hi])
    }

    #[inline(always)]
    pub fn from_f32_pair(lo: f32, hi: f32) -> Self {
        Self([f16::from_f32(lo), f16::from_f32(hi)])
    }

    #[inline(always)]
    pub fn lo(self) -> f16 {
        self.0[0]
    }

    #[inline(always)]
    pub fn hi(self) -> f16 {
        self.0[1]
    }

    #[inline(always)]
    fn map(self, f: impl Fn(f16) -> f16) -> Self {
        Self([f(self.0[0]), f(self.0[1])])
    }

    #[inline(always)]
    fn zip(self, other: Self, f: impl Fn(f16, f16) -> f16) -> Self {
        Self([f(self.0[0], other.0[0]), f(self.0[1], other.0[1])])
    }
}

macro_rules! half2_binary_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for Half2 {
            type Output = Half2;
            #[inline(always)]
            fn $method(self, rhs: Half2) -> Half2 {
                self.zip(rhs, |a, b| a $op b)
            }
        }
    };
}

half2_binary_op!(Add, add, +);
half2_binary_op!(Sub, sub, -);
half2_binary_op!(Mul, mul, *);
half2_binary_op!(Div, div, /);

impl Neg for Half2 {
    type Output = Half2;
    #[inline(always)]
    fn neg(self) -> Half2 {
        self.map(|a| -a)
    }
}

impl KernelFloat for Half2 {
    const TYPE_ID: FloatType = FloatType::Half2;
    const LANES: usize = 2;

    #[inline(always)]
    fn zero() -> Self { Self([f16::ZERO; 2]) }
    #[inline(always)]
    fn one() -> Self { Self([f16::ONE; 2]) }
    #[inline(always)]
    fn neg_limit() -> Self { Self([f16::MIN; 2]) }
    #[inline(always)]
    fn splat(v: f64) -> Self { Self([f16::from_f64(v); 2]) }
    #[inline(always)]
    fn lane(self, i: usize) -> f64 { self.0[i].to_f64() }
    #[inline(always)]
    fn exp(self) -> Self { self.map(<f16 as KernelFloat>::exp) }
    #[inline(always)]
    fn ln(self) -> Self { self.map(<f16 as KernelFloat>::ln) }
    #[inline(always)]
    fn select_gt(a: Self, b: Self, if_gt: Self, otherwise: Self) -> Self {
        Self([
            f16::select_gt(a.0[0], b.0[0], if_gt.0[0], otherwise.0[0]),
            f16::select_gt(a.0[1], b.0[1], if_gt.0[1], otherwise.0[1]),
        ])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Accumulator widening
// ────────────────────────────────────────────────────────────────────────────

/// An accumulator type able to absorb pair results of element type `T`.
///
/// Every type accumulates itself; `f64` additionally accumulates `f32` and `f32`
/// accumulates `f16`, so long reductions can run wider than their inputs.
pub trait Accumulate<T: KernelFloat>: KernelFloat {
    fn promote(x: T) -> Self;
    fn demote(self) -> T;
}

impl<T: KernelFloat> Accumulate<T> for T {
    #[inline(always)]
    fn promote(x: T) -> Self { x }
    #[inline(always)]
    fn demote(self) -> T { self }
}

impl Accumulate<f32> for f64 {
    #[inline(always)]
    fn promote(x: f32) -> Self { x as f64 }
    #[inline(always)]
    fn demote(self) -> f32 { self as f32 }
}

impl Accumulate<f16> for f32 {
    #[inline(always)]
    fn promote(x: f16) -> Self { x.to_f32() }
    #[inline(always)]
    fn demote(self) -> f16 { f16::from_f32(self) }
}

// ────────────────────────────────────────────────────────────────────────────
// Launch configuration
// ────────────────────────────────────────────────────────────────────────────

/// How sum slots are combined. Chosen once per launch, never per merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeScheme {
    /// Plain floating-point accumulation.
    #[default]
    Plain,
    /// Kahan compensated accumulation (one residual per sum slot).
    Kahan,
}

/// Configuration for a host reduction launch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Merge scheme for sum slots.
    pub merge: MergeScheme,
    /// Inner indices per partial accumulator (0 = one accumulator per row).
    pub chunk_size: usize,
    /// Distribute output rows over the rayon pool.
    pub parallel: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            merge: MergeScheme::Plain,
            chunk_size: 0,
            parallel: true,
        }
    }
}

impl LaunchConfig {
    /// Configuration for very long inner ranges (10^5+ pairs per row).
    pub fn long_reduction() -> Self {
        Self {
            merge: MergeScheme::Kahan,
            chunk_size: 4096,
            parallel: true,
        }
    }

    /// Sequential, unchunked launch. Results are bit-reproducible run to run.
    pub fn deterministic() -> Self {
        Self {
            merge: MergeScheme::Plain,
            chunk_size: 0,
            parallel: false,
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(s: &str) -> ReductionResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Default configuration with `PAIRWISE_KERNELS_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PAIRWISE_KERNELS_MERGE") {
            match v.to_ascii_lowercase().as_str() {
                "plain" => config.merge = MergeScheme::Plain,
                "kahan" => config.merge = MergeScheme::Kahan,
                other => log::warn!("Ignoring PAIRWISE_KERNELS_MERGE={other}: expected plain|kahan"),
            }
        }

        if let Ok(v) = std::env::var("PAIRWISE_KERNELS_CHUNK_SIZE") {
            match v.parse::<usize>() {
                Ok(n) => config.chunk_size = n,
                Err(e) => log::warn!("Ignoring PAIRWISE_KERNELS_CHUNK_SIZE={v}: {e}"),
            }
        }

        if let Ok(v) = std::env::var("PAIRWISE_KERNELS_PARALLEL") {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => config.parallel = true,
                "0" | "false" | "off" => config.parallel = false,
                other => log::warn!("Ignoring PAIRWISE_KERNELS_PARALLEL={other}"),
            }
        }

        config
    }
}
