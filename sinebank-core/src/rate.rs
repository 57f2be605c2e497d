//! Sample-rate advisory policy and signal-quality classification.
//!
//! The advisor aims for a fixed number of samples per cycle and snaps the result
//! onto a ladder of rates the converter accepts. Above the hardware ceiling we
//! clamp and let quality degrade instead of refusing the frequency.

use alloc::vec::Vec;
use core::fmt;

use crate::dsp::is_positive;
use crate::error::{ParamError, ParamResult};

/// Ladder of "nice" converter rates, ascending.
pub const DEFAULT_RATE_LADDER: [f64; 11] = [
    1_000.0, 2_500.0, 5_000.0, 10_000.0, 25_000.0, 50_000.0, 100_000.0, 200_000.0, 500_000.0,
    1_000_000.0, 2_000_000.0,
];

/// Longest single-period buffer accepted by default, in samples per channel.
pub const DEFAULT_MAX_PERIOD_SAMPLES: usize = 1 << 20;

/// Hardware-facing inputs to [`SampleRateAdvisor`].
#[derive(Clone, Debug, PartialEq)]
pub struct AdvisorConfig {
    /// Legal output rates in Hz. Sorted on construction of the advisor.
    pub ladder: Vec<f64>,
    /// Fastest output rate the converter accepts, Hz.
    pub max_output_rate: f64,
    /// Quality target used to derive the base rate.
    pub target_samples_per_cycle: f64,
    /// Onboard buffer limit: one period must fit in this many samples per channel.
    pub max_period_samples: usize,
    pub thresholds: QualityThresholds,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            ladder: DEFAULT_RATE_LADDER.to_vec(),
            max_output_rate: 200_000.0,
            target_samples_per_cycle: 100.0,
            max_period_samples: DEFAULT_MAX_PERIOD_SAMPLES,
            thresholds: QualityThresholds::default(),
        }
    }
}

/// Samples/cycle boundaries for each tier. A boundary value belongs to the higher tier.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct QualityThresholds {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
    /// Hard floor; configurations below it are rejected outright.
    pub floor: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self { excellent: 100.0, good: 50.0, fair: 20.0, floor: 2.0 }
    }
}

/// Coarse signal-quality label derived from samples/cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QualityTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Poor => "poor",
            QualityTier::Fair => "fair",
            QualityTier::Good => "good",
            QualityTier::Excellent => "excellent",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl QualityThresholds {
    #[inline]
    pub fn classify(&self, samples_per_cycle: f64) -> QualityTier {
        if samples_per_cycle >= self.excellent {
            QualityTier::Excellent
        } else if samples_per_cycle >= self.good {
            QualityTier::Good
        } else if samples_per_cycle >= self.fair {
            QualityTier::Fair
        } else {
            QualityTier::Poor
        }
    }
}

/// `sample_rate / frequency`, after checking both are usable.
pub fn samples_per_cycle(frequency: f64, sample_rate: f64) -> ParamResult<f64> {
    if !is_positive(frequency) {
        return Err(ParamError::InvalidFrequency(frequency));
    }
    if !is_positive(sample_rate) {
        return Err(ParamError::InvalidSampleRate(sample_rate));
    }
    Ok(sample_rate / frequency)
}

/// Frequency → sample-rate policy for one converter family.
#[derive(Clone, Debug)]
pub struct SampleRateAdvisor {
    cfg: AdvisorConfig,
}

impl Default for SampleRateAdvisor {
    fn default() -> Self {
        Self::new(AdvisorConfig::default())
    }
}

impl SampleRateAdvisor {
    pub fn new(mut cfg: AdvisorConfig) -> Self {
        cfg.ladder.retain(|r| is_positive(*r));
        cfg.ladder.sort_by(f64::total_cmp);
        cfg.ladder.dedup();
        Self { cfg }
    }

    #[inline] pub fn config(&self) -> &AdvisorConfig { &self.cfg }
    #[inline] pub fn max_output_rate(&self) -> f64 { self.cfg.max_output_rate }
    #[inline] pub fn thresholds(&self) -> &QualityThresholds { &self.cfg.thresholds }

    /// Smallest ladder rung at or above `frequency * target`, never above the ceiling.
    pub fn recommend(&self, frequency: f64) -> ParamResult<f64> {
        if !is_positive(frequency) {
            return Err(ParamError::InvalidFrequency(frequency));
        }
        let ceiling = self.cfg.max_output_rate;
        let base = frequency * self.cfg.target_samples_per_cycle;
        if base > ceiling {
            return Ok(ceiling);
        }
        let rung = self.cfg.ladder.iter().copied().find(|&r| r >= base);
        Ok(rung.map_or(ceiling, |r| r.min(ceiling)))
    }

    /// Classify a (frequency, rate) pair. Invalid inputs are reported, not classified.
    pub fn quality_tier(&self, frequency: f64, sample_rate: f64) -> ParamResult<QualityTier> {
        let spc = samples_per_cycle(frequency, sample_rate)?;
        Ok(self.cfg.thresholds.classify(spc))
    }

    /// Full acceptance check used by the control surface: positive inputs, at or under
    /// the ceiling, at or above the samples/cycle floor, and a period that fits the
    /// output buffer.
    pub fn validate(&self, frequency: f64, sample_rate: f64) -> ParamResult<QualityTier> {
        let spc = samples_per_cycle(frequency, sample_rate)?;
        if sample_rate > self.cfg.max_output_rate {
            return Err(ParamError::AboveCeiling { rate: sample_rate, ceiling: self.cfg.max_output_rate });
        }
        let floor = self.cfg.thresholds.floor;
        if spc < floor {
            return Err(ParamError::Undersampled { samples_per_cycle: spc, floor });
        }
        // floor(spc) > limit, without needing a float floor here
        let limit = self.cfg.max_period_samples;
        #[allow(clippy::cast_precision_loss)]
        let past_limit = limit as f64 + 1.0;
        if spc >= past_limit {
            return Err(ParamError::PeriodTooLong { samples: spc, limit });
        }
        Ok(self.cfg.thresholds.classify(spc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn one_khz_picks_hundred_k() {
        let adv = SampleRateAdvisor::default();
        assert_eq!(adv.recommend(1000.0).unwrap(), 100_000.0);
        assert_eq!(adv.quality_tier(1000.0, 100_000.0).unwrap(), QualityTier::Excellent);
    }

    #[test]
    fn five_khz_clamps_to_ceiling_and_is_fair() {
        let adv = SampleRateAdvisor::default();
        let sr = adv.recommend(5000.0).unwrap();
        assert_eq!(sr, 200_000.0);
        assert_eq!(adv.quality_tier(5000.0, sr).unwrap(), QualityTier::Fair);
    }

    #[test]
    fn low_frequencies_snap_to_first_rung() {
        let adv = SampleRateAdvisor::default();
        assert_eq!(adv.recommend(0.5).unwrap(), 1_000.0);
        assert_eq!(adv.recommend(10.0).unwrap(), 1_000.0);
        assert_eq!(adv.recommend(10.01).unwrap(), 2_500.0);
    }

    #[test]
    fn tier_boundaries_are_exact() {
        let t = QualityThresholds::default();
        assert_eq!(t.classify(100.0), QualityTier::Excellent);
        assert_eq!(t.classify(99.999), QualityTier::Good);
        assert_eq!(t.classify(50.0), QualityTier::Good);
        assert_eq!(t.classify(49.999), QualityTier::Fair);
        assert_eq!(t.classify(20.0), QualityTier::Fair);
        assert_eq!(t.classify(19.999), QualityTier::Poor);
    }

    #[test]
    fn validate_rejects_below_floor_and_above_ceiling() {
        let adv = SampleRateAdvisor::default();
        assert!(matches!(adv.validate(60_000.0, 100_000.0), Err(ParamError::Undersampled { .. })));
        assert!(matches!(adv.validate(1000.0, 500_000.0), Err(ParamError::AboveCeiling { .. })));
        assert_eq!(adv.validate(50_000.0, 100_000.0).unwrap(), QualityTier::Poor);
        assert!(matches!(adv.validate(0.0, 100_000.0), Err(ParamError::InvalidFrequency(_))));
    }

    #[test]
    fn validate_rejects_periods_beyond_the_buffer() {
        let adv = SampleRateAdvisor::default();
        assert!(matches!(
            adv.validate(1e-6, 1_000.0),
            Err(ParamError::PeriodTooLong { limit: DEFAULT_MAX_PERIOD_SAMPLES, .. })
        ));
        // the advisor still recommends a rate; acceptance is a separate check
        assert_eq!(adv.recommend(1e-7).unwrap(), 1_000.0);
        assert!(adv.validate(1e-7, 1_000.0).is_err());

        let small = SampleRateAdvisor::new(AdvisorConfig { max_period_samples: 1_000, ..AdvisorConfig::default() });
        assert_eq!(small.validate(1.0, 1_000.0).unwrap(), QualityTier::Excellent);
        assert_eq!(small.validate(0.9995, 1_000.0).unwrap(), QualityTier::Excellent);
        assert!(matches!(small.validate(0.5, 1_000.0), Err(ParamError::PeriodTooLong { limit: 1_000, .. })));
    }

    #[test]
    fn custom_ceiling_and_unsorted_ladder() {
        let adv = SampleRateAdvisor::new(AdvisorConfig {
            ladder: vec![48_000.0, 8_000.0, 96_000.0, 44_100.0],
            max_output_rate: 96_000.0,
            ..AdvisorConfig::default()
        });
        assert_eq!(adv.recommend(100.0).unwrap(), 44_100.0);
        assert_eq!(adv.recommend(450.0).unwrap(), 48_000.0);
        assert_eq!(adv.recommend(2_000.0).unwrap(), 96_000.0);
    }

    #[test]
    fn ladder_rungs_above_ceiling_are_not_used() {
        let adv = SampleRateAdvisor::new(AdvisorConfig {
            ladder: vec![1_000.0, 500_000.0],
            max_output_rate: 204_800.0,
            ..AdvisorConfig::default()
        });
        assert_eq!(adv.recommend(1_500.0).unwrap(), 204_800.0);
    }

    proptest! {
        #[test]
        fn recommend_is_monotonic_and_capped(a in 0.01f64..100_000.0, b in 0.01f64..100_000.0) {
            let adv = SampleRateAdvisor::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let r_lo = adv.recommend(lo).unwrap();
            let r_hi = adv.recommend(hi).unwrap();
            prop_assert!(r_lo <= r_hi);
            prop_assert!(r_hi <= adv.max_output_rate());
        }
    }
}
