//! Batch measurements and clipping policy for monitored inputs.

use core::fmt;

use num_traits::Float;

use crate::dsp::{peak_abs, rms};

/// RMS and peak-absolute over one acquisition batch. Both are always `>= 0`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Measurement {
    pub rms: f64,
    pub peak: f64,
}

impl Measurement {
    pub const ZERO: Self = Self { rms: 0.0, peak: 0.0 };

    /// Measure a block; non-finite samples are ignored so a single glitch cannot
    /// poison the cached value.
    pub fn of(block: &[f64]) -> Self {
        if block.iter().all(|x| x.is_finite()) {
            return Self { rms: rms(block), peak: peak_abs(block) };
        }
        let clean: alloc::vec::Vec<f64> = block.iter().copied().filter(|x| x.is_finite()).collect();
        Self { rms: rms(&clean), peak: peak_abs(&clean) }
    }
}

/// Fractions of full scale at which the clip alarm fires.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ClipThresholds {
    pub clipping: f64,
    pub near: f64,
}

impl Default for ClipThresholds {
    fn default() -> Self {
        Self { clipping: 0.95, near: 0.90 }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClipState {
    #[default]
    Clear,
    NearClipping,
    Clipping,
}

impl fmt::Display for ClipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClipState::Clear => "ok",
            ClipState::NearClipping => "near clipping",
            ClipState::Clipping => "clipping",
        })
    }
}

impl ClipThresholds {
    /// Strictly-greater comparisons: a peak exactly at a threshold does not trip it.
    #[inline]
    pub fn classify(&self, peak: f64, full_scale: f64) -> ClipState {
        let full_scale = Float::abs(full_scale);
        if peak > self.clipping * full_scale {
            ClipState::Clipping
        } else if peak > self.near * full_scale {
            ClipState::NearClipping
        } else {
            ClipState::Clear
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_a_square_block() {
        let m = Measurement::of(&[1.0, -1.0, 1.0, -1.0]);
        assert_eq!(m, Measurement { rms: 1.0, peak: 1.0 });
    }

    #[test]
    fn empty_block_is_zero() {
        assert_eq!(Measurement::of(&[]), Measurement::ZERO);
    }

    #[test]
    fn non_finite_samples_are_skipped() {
        let m = Measurement::of(&[f64::NAN, 0.5, -0.5]);
        assert_eq!(m.peak, 0.5);
        assert!((m.rms - 0.5).abs() < 1e-12);
    }

    #[test]
    fn clip_classification() {
        let t = ClipThresholds::default();
        assert_eq!(t.classify(9.6, 10.0), ClipState::Clipping);
        assert_eq!(t.classify(9.5, 10.0), ClipState::NearClipping);
        assert_eq!(t.classify(9.2, 10.0), ClipState::NearClipping);
        assert_eq!(t.classify(9.0, 10.0), ClipState::Clear);
        assert_eq!(t.classify(0.0, 10.0), ClipState::Clear);
    }
}
