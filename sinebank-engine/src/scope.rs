//! Rolling per-channel sample windows for the live scope view.
//!
//! The worker pushes whole read batches; readers only ever get copies. Each push is
//! applied under the lock in one go, so a concurrent `snapshot` sees the window
//! either before or after a batch, never half of one.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use sinebank_core::meter::{ClipState, ClipThresholds, Measurement};

use crate::registry::ChannelAddress;

/// Default window length, in samples.
pub const DEFAULT_SCOPE_CAPACITY: usize = 5_000;

#[derive(Debug, Default)]
struct Trace {
    samples: VecDeque<f64>,
    measurement: Measurement,
}

#[derive(Debug)]
pub struct ScopeBuffer {
    capacity: usize,
    traces: Mutex<HashMap<ChannelAddress, Trace>>,
}

impl Default for ScopeBuffer {
    fn default() -> Self { Self::new(DEFAULT_SCOPE_CAPACITY) }
}

impl ScopeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), traces: Mutex::new(HashMap::new()) }
    }

    #[inline] pub fn capacity(&self) -> usize { self.capacity }

    /// Append a batch, keep the newest `capacity` samples, and cache the batch's
    /// measurement. Returns that measurement.
    pub fn push(&self, channel: &ChannelAddress, batch: &[f64]) -> Measurement {
        // Measure before taking the lock; readers should never wait on arithmetic.
        let measurement = Measurement::of(batch);
        let tail = &batch[batch.len().saturating_sub(self.capacity)..];

        let mut traces = self.traces.lock();
        let trace = traces.entry(channel.clone()).or_default();
        trace.samples.extend(tail.iter().copied());
        let excess = trace.samples.len().saturating_sub(self.capacity);
        trace.samples.drain(..excess);
        trace.measurement = measurement;
        measurement
    }

    /// Copy of the current window, oldest first. Unknown channels give an empty window.
    pub fn snapshot(&self, channel: &ChannelAddress) -> Vec<f64> {
        self.traces
            .lock()
            .get(channel)
            .map(|t| t.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Measurement of the most recent batch, or zero if nothing was acquired.
    pub fn measurement(&self, channel: &ChannelAddress) -> Measurement {
        self.traces.lock().get(channel).map_or(Measurement::ZERO, |t| t.measurement)
    }

    pub fn clip_state(&self, channel: &ChannelAddress, thresholds: &ClipThresholds, full_scale: f64) -> ClipState {
        thresholds.classify(self.measurement(channel).peak, full_scale)
    }

    pub fn len(&self, channel: &ChannelAddress) -> usize {
        self.traces.lock().get(channel).map_or(0, |t| t.samples.len())
    }

    pub fn is_empty(&self, channel: &ChannelAddress) -> bool { self.len(channel) == 0 }

    /// Monitoring stopped: zero every cached measurement but keep the last windows
    /// on screen.
    pub fn reset_measurements(&self) {
        for trace in self.traces.lock().values_mut() {
            trace.measurement = Measurement::ZERO;
        }
    }

    pub fn clear(&self) {
        self.traces.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn ch() -> ChannelAddress { ChannelAddress::new("SV1", 0) }

    #[test]
    fn keeps_last_capacity_samples_in_order() {
        let scope = ScopeBuffer::new(10);
        let mut next = 0.0;
        for len in [3usize, 4, 5, 6] {
            let batch: Vec<f64> = (0..len).map(|_| { next += 1.0; next }).collect();
            scope.push(&ch(), &batch);
        }
        // 18 samples pushed in total; the window holds 9..=18
        let expected: Vec<f64> = (9..=18).map(f64::from).collect();
        assert_eq!(scope.snapshot(&ch()), expected);
    }

    #[test]
    fn oversized_batch_keeps_its_tail() {
        let scope = ScopeBuffer::new(4);
        let batch: Vec<f64> = (0..10).map(f64::from).collect();
        scope.push(&ch(), &batch);
        assert_eq!(scope.snapshot(&ch()), vec![6.0, 7.0, 8.0, 9.0]);
        // measurement covers the whole batch, not just what fits
        assert_eq!(scope.measurement(&ch()).peak, 9.0);
    }

    #[test]
    fn partial_fill_and_unknown_channels() {
        let scope = ScopeBuffer::new(5000);
        scope.push(&ch(), &[1.0, -2.0]);
        assert_eq!(scope.len(&ch()), 2);
        let other = ChannelAddress::new("SV2", 1);
        assert!(scope.snapshot(&other).is_empty());
        assert_eq!(scope.measurement(&other), Measurement::ZERO);
    }

    #[test]
    fn measurement_is_per_latest_batch_and_resets() {
        let scope = ScopeBuffer::new(100);
        scope.push(&ch(), &[9.7, -9.7]);
        assert_eq!(scope.clip_state(&ch(), &ClipThresholds::default(), 10.0), ClipState::Clipping);
        scope.push(&ch(), &[0.5, -0.5]);
        let m = scope.measurement(&ch());
        assert_eq!(m.peak, 0.5);
        assert!((m.rms - 0.5).abs() < 1e-12);
        scope.reset_measurements();
        assert_eq!(scope.measurement(&ch()), Measurement::ZERO);
        assert_eq!(scope.len(&ch()), 4);
    }

    #[test]
    fn snapshots_never_see_half_a_batch() {
        const BATCH: usize = 50;
        let scope = Arc::new(ScopeBuffer::new(BATCH * 20));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let scope = Arc::clone(&scope);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let batch: Vec<f64> = (0..BATCH).map(|i| i as f64).collect();
                    scope.push(&ch(), &batch);
                }
                done.store(true, Ordering::Release);
            })
        };

        while !done.load(Ordering::Acquire) {
            let snap = scope.snapshot(&ch());
            assert_eq!(snap.len() % BATCH, 0, "torn window of {} samples", snap.len());
            for chunk in snap.chunks(BATCH) {
                assert_eq!(chunk.first().copied(), Some(0.0));
                assert_eq!(chunk.last().copied(), Some((BATCH - 1) as f64));
            }
        }
        writer.join().unwrap();
    }
}
