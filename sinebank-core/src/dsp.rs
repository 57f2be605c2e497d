//! Math backend and small numeric helpers shared by the synthesizer and meters.
//!
//! Design goals:
//! - `no_std` ready (guarded by the crate feature `no-std`)
//! - Math backend selection that works in both `std` and `no_std` contexts
//! - Clean, side-effect free helpers that are easy to test
//!
//! Conventions:
//! - Everything is `f64`: buffers go straight to converter hardware, so we keep
//!   full precision until the driver decides otherwise.
//! - Amplitudes travel through the system in microvolts and become volts here.

use num_traits::Float;

use cfg_if::cfg_if;

// ----------------------------- Math backend selection -----------------------------

cfg_if! {
    // libm (C math) in no_std
    if #[cfg(feature = "no-std")] {
        #[inline] pub(crate) fn m_sin(x: f64) -> f64 { libm::sin(x) }
        #[inline] pub(crate) fn m_floor(x: f64) -> f64 { libm::floor(x) }
    // std backend
    } else {
        #[inline] pub(crate) fn m_sin(x: f64) -> f64 { x.sin() }
        #[inline] pub(crate) fn m_floor(x: f64) -> f64 { x.floor() }
    }
}

// --------------------------------- Constants -------------------------------------

/// 2π
pub const TAU: f64 = core::f64::consts::TAU;

/// Microvolts per volt.
pub const UV_PER_VOLT: f64 = 1.0e6;

// --------------------------------- Units -----------------------------------------

/// Convert a microvolt amplitude to volts.
#[inline]
pub fn uv_to_volts(uv: f64) -> f64 {
    uv / UV_PER_VOLT
}

/// Convert volts to microvolts.
#[inline]
pub fn volts_to_uv(v: f64) -> f64 {
    v * UV_PER_VOLT
}

/// `true` for finite values strictly above zero.
#[inline]
pub fn is_positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

// --------------------------------- Block statistics ------------------------------

/// Root-mean-square of a block. Empty blocks measure zero.
#[inline]
pub fn rms<T: Float>(block: &[T]) -> T {
    if block.is_empty() {
        return T::zero();
    }
    let sum_sq = block.iter().fold(T::zero(), |acc, &x| acc + x * x);
    let n = T::from(block.len()).unwrap_or_else(T::one);
    (sum_sq / n).sqrt()
}

/// Largest absolute value in a block. Empty blocks measure zero.
#[inline]
pub fn peak_abs<T: Float>(block: &[T]) -> T {
    block.iter().fold(T::zero(), |max, &x| max.max(x.abs()))
}

// --------------------------------- Tests (std only) ------------------------------
