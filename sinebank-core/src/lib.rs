#![cfg_attr(not(feature = "std"), no_std)]
//! sinebank core: waveform synthesis, sample-rate policy and signal measurement.
//!
//! Features
//! - `std`      : (default) use the Rust standard library
//! - `no-std`   : build with `#![no_std]` (+ `alloc`) and use `libm` for math
//!
//! Modules
//! - [`dsp`]   : math backend, unit conversion, block statistics
//! - [`synth`] : one-period sine buffers for regenerating outputs
//! - [`rate`]  : sample-rate advisor and quality tiers
//! - [`meter`] : batch measurements and clipping policy
//! - [`error`] : configuration errors
//!
//! Design
//! - Pure functions and plain data; nothing here touches hardware or threads
//! - Every policy constant lives in a config struct with a `Default`

extern crate alloc;

pub mod dsp;
pub mod error;
pub mod meter;
pub mod rate;
pub mod synth;

pub use error::{ParamError, ParamResult};

/// Commonly used types/functions for convenience:
pub mod prelude {
    pub use crate::dsp::{peak_abs, rms, uv_to_volts, volts_to_uv, TAU};
    pub use crate::error::{ParamError, ParamResult};
    pub use crate::meter::{ClipState, ClipThresholds, Measurement};
    pub use crate::rate::{
        samples_per_cycle, AdvisorConfig, QualityThresholds, QualityTier, SampleRateAdvisor,
    };
    pub use crate::synth::{period_samples, synthesize, MIN_PERIOD_SAMPLES};
}

#[cfg(test)]
mod smoke {

    #[test]
    fn prelude_exists() {
        use crate::prelude::*;
        let adv = SampleRateAdvisor::default();
        let sr = adv.recommend(1000.0).unwrap();
        let buf = synthesize(1000.0, uv_to_volts(1000.0), sr).unwrap();
        let m = Measurement::of(&buf);
        assert!(m.peak > 0.0);
        assert_eq!(ClipThresholds::default().classify(m.peak, 10.0), ClipState::Clear);
    }
}
