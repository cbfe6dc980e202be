//! Compensated summation for long reductions.
//!
//! [`kahan_add`] is the single compensated step used by the Kahan merge of every
//! reduction; [`KahanAccumulator`] wraps it for callers that fold a plain stream of
//! values (reference computations, post-processing).

use crate::kernel_types::KernelFloat;

/// One Kahan step: adds `x` to `sum`, carrying the rounding error in `comp`.
///
/// `comp` holds the low-order bits lost so far and is subtracted from the next
/// addend. Lane-wise for packed types.
#[inline(always)]
pub fn kahan_add<A: KernelFloat>(sum: &mut A, comp: &mut A, x: A) {
    let y = x - *comp;
    let t = *sum + y;
    *comp = (t - *sum) - y;
    *sum = t;
}

/// Running Kahan sum of a plain stream of values.
#[derive(Debug, Clone, Copy)]
pub struct KahanAccumulator<T> {
    sum: T,
    /// Compensation term for lost low-order bits.
    c: T,
}

impl<T: KernelFloat> Default for KahanAccumulator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: KernelFloat> KahanAccumulator<T> {
    pub fn new() -> Self {
        Self { sum: T::zero(), c: T::zero() }
    }

    #[inline]
    pub fn add(&mut self, x: T) {
        kahan_add(&mut self.sum, &mut self.c, x);
    }

    /// Sum with the pending compensation applied.
    #[inline]
    pub fn corrected_value(&self) -> T {
        self.sum - self.c
    }
}
