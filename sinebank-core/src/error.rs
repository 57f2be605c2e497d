//! Configuration errors raised by the parameter policies.

use thiserror::Error;

/// A rejected generation parameter. The caller's previous state stays in effect.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ParamError {
    #[error("invalid frequency {0} Hz: must be finite and > 0")]
    InvalidFrequency(f64),

    #[error("invalid amplitude {0}: must be finite and >= 0")]
    InvalidAmplitude(f64),

    #[error("invalid sample rate {0} Hz: must be finite and > 0")]
    InvalidSampleRate(f64),

    #[error("{samples_per_cycle:.3} samples/cycle is below the floor of {floor}")]
    Undersampled { samples_per_cycle: f64, floor: f64 },

    #[error("sample rate {rate} Hz exceeds the hardware ceiling of {ceiling} Hz")]
    AboveCeiling { rate: f64, ceiling: f64 },

    #[error("{samples:.0} samples per period exceeds the output buffer limit of {limit}")]
    PeriodTooLong { samples: f64, limit: usize },
}

pub type ParamResult<T> = Result<T, ParamError>;
