//! One-period sine synthesis for regenerating output buffers.
//!
//! The hardware replays whatever we write indefinitely, so the buffer must hold
//! exactly one period: `n = max(2, floor(sample_rate / frequency))` samples at
//! uniform spacing over `[0, period)`. When `sample_rate / frequency` is not an
//! integer the spacing is `period / n` rather than `1 / sample_rate`, which keeps
//! the loop seamless at the cost of a tiny frequency error the converter clock
//! absorbs.

use alloc::vec::Vec;

use crate::dsp::{is_positive, m_floor, m_sin, TAU};
use crate::error::{ParamError, ParamResult};

/// Smallest buffer that still describes a periodic waveform.
pub const MIN_PERIOD_SAMPLES: usize = 2;

/// Number of samples in one synthesized period.
pub fn period_samples(frequency: f64, sample_rate: f64) -> ParamResult<usize> {
    check(frequency, sample_rate)?;
    let n = m_floor(sample_rate / frequency);
    // Saturating float->int cast keeps absurd ratios bounded instead of wrapping.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let n = n as usize;
    Ok(n.max(MIN_PERIOD_SAMPLES))
}

/// Synthesize one period of `amplitude * sin(2π f t)`.
///
/// `amplitude` is in output units (volts at the call sites in the engine) and may be
/// negative, which simply inverts the phase.
pub fn synthesize(frequency: f64, amplitude: f64, sample_rate: f64) -> ParamResult<Vec<f64>> {
    if !amplitude.is_finite() {
        return Err(ParamError::InvalidAmplitude(amplitude));
    }
    let n = period_samples(frequency, sample_rate)?;
    let mut out = Vec::with_capacity(n);
    fill_period(&mut out, n, amplitude);
    Ok(out)
}

/// Fill `out` with `n` samples covering one full turn of phase.
#[inline]
fn fill_period(out: &mut Vec<f64>, n: usize, amplitude: f64) {
    #[allow(clippy::cast_precision_loss)]
    let step = TAU / n as f64;
    for i in 0..n {
        #[allow(clippy::cast_precision_loss)]
        let phase = step * i as f64;
        out.push(amplitude * m_sin(phase));
    }
}

#[inline]
fn check(frequency: f64, sample_rate: f64) -> ParamResult<()> {
    if !is_positive(frequency) {
        return Err(ParamError::InvalidFrequency(frequency));
    }
    if !is_positive(sample_rate) {
        return Err(ParamError::InvalidSampleRate(sample_rate));
    }
    Ok(())
}
