//! The generation engine: control surface, lifecycle and background worker.
//!
//! Callers edit channel settings and parameters under one short control lock. A
//! single worker thread per running engine snapshots that state once per poll
//! interval and hands it to a [`Reconciler`], which is the only thing that ever
//! touches hardware tasks.
//!
//! Lifecycle: `Idle → Starting → Running → Stopping → Idle`. A fatal driver error or
//! a panic inside the worker releases every task and drops the engine back to
//! `Idle`; callers observe it through [`GenerationEngine::is_running`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use sinebank_core::dsp::volts_to_uv;
use sinebank_core::meter::{ClipState, ClipThresholds, Measurement};
use sinebank_core::rate::{AdvisorConfig, QualityTier, SampleRateAdvisor};
use sinebank_core::ParamError;
use thiserror::Error;

use crate::driver::{Driver, DriverError, VoltageRange};
use crate::reconcile::{ReconcileSettings, Reconciler};
use crate::registry::{ChannelAddress, ChannelConfig, ChannelRegistry, ControlState, GenerationParameters, Topology};
use crate::scope::{ScopeBuffer, DEFAULT_SCOPE_CAPACITY};

/// Everything an engine instance is built from.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub topology: Topology,
    pub advisor: AdvisorConfig,
    pub clip: ClipThresholds,
    pub output_range: VoltageRange,
    pub input_range: VoltageRange,
    /// Acquisition rate for monitoring inputs, Hz.
    pub max_input_rate: f64,
    /// Input buffer length expressed in seconds of data.
    pub input_buffer_seconds: f64,
    /// Samples requested per input channel per worker pass.
    pub read_batch: usize,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    /// How long `stop` waits for the worker before forcing cleanup.
    pub stop_timeout: Duration,
    pub scope_capacity: usize,
    pub initial_params: GenerationParameters,
    pub initial_channel: ChannelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            advisor: AdvisorConfig::default(),
            clip: ClipThresholds::default(),
            output_range: VoltageRange::BIPOLAR_10V,
            input_range: VoltageRange::BIPOLAR_10V,
            max_input_rate: 200_000.0,
            input_buffer_seconds: 2.0,
            read_batch: 1_000,
            read_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            scope_capacity: DEFAULT_SCOPE_CAPACITY,
            initial_params: GenerationParameters::default(),
            initial_channel: ChannelConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use] pub fn with_topology(mut self, topology: Topology) -> Self { self.topology = topology; self }
    #[must_use] pub fn with_advisor(mut self, advisor: AdvisorConfig) -> Self { self.advisor = advisor; self }
    #[must_use] pub fn with_clip_thresholds(mut self, clip: ClipThresholds) -> Self { self.clip = clip; self }
    #[must_use] pub fn with_output_range(mut self, r: VoltageRange) -> Self { self.output_range = r; self }
    #[must_use] pub fn with_input_range(mut self, r: VoltageRange) -> Self { self.input_range = r; self }
    #[must_use] pub fn with_max_input_rate(mut self, hz: f64) -> Self { self.max_input_rate = hz; self }
    #[must_use] pub fn with_input_buffer_seconds(mut self, s: f64) -> Self { self.input_buffer_seconds = s; self }
    #[must_use] pub fn with_read_batch(mut self, n: usize) -> Self { self.read_batch = n; self }
    #[must_use] pub fn with_read_timeout(mut self, d: Duration) -> Self { self.read_timeout = d; self }
    #[must_use] pub fn with_poll_interval(mut self, d: Duration) -> Self { self.poll_interval = d; self }
    #[must_use] pub fn with_stop_timeout(mut self, d: Duration) -> Self { self.stop_timeout = d; self }
    #[must_use] pub fn with_scope_capacity(mut self, n: usize) -> Self { self.scope_capacity = n; self }
    #[must_use] pub fn with_parameters(mut self, p: GenerationParameters) -> Self { self.initial_params = p; self }
    #[must_use] pub fn with_initial_channel(mut self, c: ChannelConfig) -> Self { self.initial_channel = c; self }

    fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            output_range: self.output_range,
            input_range: self.input_range,
            max_input_rate: self.max_input_rate,
            input_buffer_seconds: self.input_buffer_seconds,
            read_batch: self.read_batch,
            read_timeout: self.read_timeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker exited before it started")]
    WorkerPanicked,
}

pub type EngineResult<T> = Result<T, EngineError>;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// Non-error outcomes of [`GenerationEngine::start`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartStatus {
    Started { channels: usize },
    AlreadyRunning,
    NoChannelsEnabled,
}

impl StartStatus {
    pub fn is_started(&self) -> bool { matches!(self, Self::Started { .. }) }
}

impl fmt::Display for StartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { channels } => write!(f, "Started generation on {channels} channel(s)"),
            Self::AlreadyRunning => f.write_str("Generator already running"),
            Self::NoChannelsEnabled => f.write_str("No channels enabled. Please enable at least one channel."),
        }
    }
}

/// Shared between the engine and its worker thread.
struct Shared<D: Driver> {
    driver: Arc<D>,
    config: Arc<EngineConfig>,
    control: Mutex<ControlState>,
    scope: ScopeBuffer,
    state: AtomicU8,
}

impl<D: Driver> Shared<D> {
    fn state(&self) -> EngineState { EngineState::from_u8(self.state.load(Ordering::Acquire)) }
    fn set_state(&self, s: EngineState) { self.state.store(s as u8, Ordering::Release); }
}

struct Worker<D: Driver> {
    cancel: Arc<AtomicBool>,
    wake: Sender<()>,
    done: Receiver<()>,
    reconciler: Arc<Mutex<Reconciler<D>>>,
    handle: JoinHandle<()>,
}

pub struct GenerationEngine<D: Driver> {
    shared: Arc<Shared<D>>,
    advisor: SampleRateAdvisor,
    /// Serializes start/stop; also holds the live worker.
    worker: Mutex<Option<Worker<D>>>,
}

impl<D: Driver> GenerationEngine<D> {
    pub fn new(driver: Arc<D>, config: EngineConfig) -> Self {
        let registry = ChannelRegistry::new(&config.topology, config.initial_channel);
        let control = ControlState { registry, params: config.initial_params };
        let advisor = SampleRateAdvisor::new(config.advisor.clone());
        let scope = ScopeBuffer::new(config.scope_capacity);
        Self {
            shared: Arc::new(Shared {
                driver,
                config: Arc::new(config),
                control: Mutex::new(control),
                scope,
                state: AtomicU8::new(EngineState::Idle as u8),
            }),
            advisor,
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.shared.config }

    pub fn advisor(&self) -> &SampleRateAdvisor { &self.advisor }

    pub fn driver(&self) -> &Arc<D> { &self.shared.driver }

    // --- control surface ---------------------------------------------------------

    /// Apply a frequency and output rate together. Rejected pairs leave state as is.
    pub fn set_frequency_and_rate(&self, frequency: f64, sample_rate: f64) -> EngineResult<QualityTier> {
        let tier = self.advisor.validate(frequency, sample_rate)?;
        self.shared.control.lock().params = GenerationParameters { frequency, output_sample_rate: sample_rate };
        log::info!("[engine] frequency {frequency} Hz @ {sample_rate} S/s ({tier})");
        Ok(tier)
    }

    /// Apply `frequency` with the advisor's recommended output rate.
    pub fn set_frequency(&self, frequency: f64) -> EngineResult<GenerationParameters> {
        let rate = self.advisor.recommend(frequency)?;
        self.set_frequency_and_rate(frequency, rate)?;
        Ok(GenerationParameters { frequency, output_sample_rate: rate })
    }

    /// Set a channel's amplitude in microvolts (rounded to whole µV).
    ///
    /// Negative, non-finite or beyond-full-scale amplitudes are rejected. Returns
    /// `false` when the address is outside the card grid, which is otherwise a no-op.
    pub fn set_channel_amplitude(&self, address: &ChannelAddress, amplitude_uv: f64) -> EngineResult<bool> {
        let ceiling = volts_to_uv(self.shared.config.output_range.full_scale());
        if !(amplitude_uv.is_finite() && amplitude_uv >= 0.0 && amplitude_uv <= ceiling) {
            return Err(ParamError::InvalidAmplitude(amplitude_uv).into());
        }
        #[allow(clippy::cast_possible_truncation)]
        let uv = amplitude_uv.round() as i64;
        let known = self.shared.control.lock().registry.set_amplitude(address, uv);
        if !known {
            log::debug!("[engine] ignoring amplitude for unknown channel {address}");
        }
        Ok(known)
    }

    /// Returns `false` when the address is outside the card grid.
    pub fn set_channel_enabled(&self, address: &ChannelAddress, enabled: bool) -> bool {
        let known = self.shared.control.lock().registry.set_enabled(address, enabled);
        if !known {
            log::debug!("[engine] ignoring enable for unknown channel {address}");
        }
        known
    }

    /// Disable every channel and restore the default amplitude.
    pub fn reset_channels(&self) {
        self.shared.control.lock().registry.reset();
    }

    pub fn channel(&self, address: &ChannelAddress) -> Option<ChannelConfig> {
        self.shared.control.lock().registry.get(address)
    }

    pub fn enabled_channels(&self) -> Vec<ChannelAddress> {
        self.shared.control.lock().snapshot().enabled.into_iter().map(|(a, _)| a).collect()
    }

    pub fn parameters(&self) -> GenerationParameters { self.shared.control.lock().params }

    pub fn samples_per_cycle(&self) -> f64 {
        let p = self.parameters();
        p.output_sample_rate / p.frequency
    }

    pub fn quality(&self) -> EngineResult<QualityTier> {
        let p = self.parameters();
        Ok(self.advisor.quality_tier(p.frequency, p.output_sample_rate)?)
    }

    // --- monitoring --------------------------------------------------------------

    pub fn scope_snapshot(&self, address: &ChannelAddress) -> Vec<f64> { self.shared.scope.snapshot(address) }

    pub fn measurement(&self, address: &ChannelAddress) -> Measurement { self.shared.scope.measurement(address) }

    pub fn clip_state(&self, address: &ChannelAddress) -> ClipState {
        let cfg = &self.shared.config;
        self.shared.scope.clip_state(address, &cfg.clip, cfg.input_range.full_scale())
    }

    // --- lifecycle ---------------------------------------------------------------

    pub fn state(&self) -> EngineState { self.shared.state() }

    /// Never blocks.
    pub fn is_running(&self) -> bool { self.state() == EngineState::Running }

    /// Spawn the worker and return once it has begun.
    pub fn start(&self) -> EngineResult<StartStatus> {
        let mut slot = self.worker.lock();
        if slot.is_some() && self.is_running() {
            return Ok(StartStatus::AlreadyRunning);
        }
        // A worker that died on its own is already idle; collect it.
        if let Some(stale) = slot.take() {
            reap(stale, self.shared.config.stop_timeout);
        }

        let channels = self.shared.control.lock().registry.enabled_count();
        if channels == 0 {
            log::info!("[engine] start ignored: no channels enabled");
            return Ok(StartStatus::NoChannelsEnabled);
        }

        self.shared.set_state(EngineState::Starting);
        let reconciler = Arc::new(Mutex::new(Reconciler::new(
            Arc::clone(&self.shared.driver),
            self.shared.config.reconcile_settings(),
        )));
        let cancel = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let (started_tx, started_rx) = bounded::<()>(1);

        let ctx = WorkerContext {
            shared: Arc::clone(&self.shared),
            reconciler: Arc::clone(&reconciler),
            cancel: Arc::clone(&cancel),
            wake: wake_rx,
        };
        let spawned = std::thread::Builder::new()
            .name("sinebank-worker".into())
            .spawn(move || run_worker(&ctx, &started_tx, &done_tx));
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.shared.set_state(EngineState::Idle);
                return Err(EngineError::Spawn(e));
            }
        };

        if started_rx.recv().is_err() {
            let _ = handle.join();
            self.shared.set_state(EngineState::Idle);
            return Err(EngineError::WorkerPanicked);
        }

        *slot = Some(Worker { cancel, wake: wake_tx, done: done_rx, reconciler, handle });
        log::info!("[engine] started on {channels} channel(s)");
        Ok(StartStatus::Started { channels })
    }

    /// Cancel the worker and wait up to `stop_timeout` for it, then release whatever
    /// it left open. Bounded even when a driver call hangs; tasks held by such a
    /// call are closed by the worker once it returns. Safe to call at any time,
    /// including when already stopped.
    pub fn stop(&self) {
        let mut slot = self.worker.lock();
        let Some(worker) = slot.take() else { return };
        self.shared.set_state(EngineState::Stopping);
        reap(worker, self.shared.config.stop_timeout);
        self.shared.scope.reset_measurements();
        self.shared.set_state(EngineState::Idle);
        log::info!("[engine] stopped");
    }
}

impl<D: Driver> Drop for GenerationEngine<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Signal, wait (bounded), then release whatever the worker left open.
///
/// Returns within roughly twice `timeout`. A worker wedged inside a driver call
/// still holds the reconciler, so its tasks are not closed here: the worker
/// closes them itself once that call returns and it sees the cancel flag. The
/// cleanup is deferred, never forced from this thread.
fn reap<D: Driver>(worker: Worker<D>, timeout: Duration) {
    worker.cancel.store(true, Ordering::Release);
    let _ = worker.wake.try_send(());
    match worker.done.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if worker.handle.join().is_err() {
                log::error!("[engine] worker thread panicked");
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("[engine] worker did not exit within {timeout:?}; forcing cleanup");
        }
    }
    // Safety net: release anything still open, unless the worker is wedged
    // inside a driver call while holding the reconciler.
    match worker.reconciler.try_lock_for(timeout) {
        Some(mut rec) => {
            let n = rec.shutdown();
            if n > 0 {
                log::warn!("[engine] force-closed {n} task(s) left by the worker");
            }
        }
        None => log::error!("[engine] reconciler still busy; tasks will be released when the worker returns"),
    }
}

struct WorkerContext<D: Driver> {
    shared: Arc<Shared<D>>,
    reconciler: Arc<Mutex<Reconciler<D>>>,
    cancel: Arc<AtomicBool>,
    wake: Receiver<()>,
}

fn run_worker<D: Driver>(ctx: &WorkerContext<D>, started: &Sender<()>, done: &Sender<()>) {
    ctx.shared.set_state(EngineState::Running);
    let _ = started.send(());
    log::info!("[engine] worker running");

    let outcome = catch_unwind(AssertUnwindSafe(|| worker_loop(ctx)));
    let clean = match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::error!("[engine] fatal driver error, shutting down: {e}");
            false
        }
        Err(_) => {
            log::error!("[engine] worker panicked, shutting down");
            false
        }
    };

    let released = ctx.reconciler.lock().shutdown();
    log::debug!("[engine] worker released {released} task(s)");
    if !clean {
        ctx.shared.scope.reset_measurements();
        // Only a worker that stopped by itself moves the engine to Idle; a
        // requested stop is finished by `stop`.
        let _ = ctx.shared.state.compare_exchange(
            EngineState::Running as u8,
            EngineState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
    let _ = done.send(());
    log::info!("[engine] worker exited");
}

fn worker_loop<D: Driver>(ctx: &WorkerContext<D>) -> Result<(), DriverError> {
    let poll = ctx.shared.config.poll_interval;
    loop {
        if ctx.cancel.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = ctx.shared.control.lock().snapshot();
        let report = ctx.reconciler.lock().step(&snapshot, &ctx.shared.scope)?;
        if report.changed() || !report.failed.is_empty() {
            log::debug!(
                "[engine] pass: {} configured, {} torn down, {} failing",
                report.configured.len(),
                report.torn_down.len(),
                report.failed.len()
            );
        }
        match ctx.wake.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;

    fn engine() -> GenerationEngine<SimDriver> {
        let cfg = EngineConfig::default().with_poll_interval(Duration::from_millis(5));
        GenerationEngine::new(Arc::new(SimDriver::new()), cfg)
    }

    #[test]
    fn status_strings() {
        assert_eq!(StartStatus::AlreadyRunning.to_string(), "Generator already running");
        assert_eq!(
            StartStatus::NoChannelsEnabled.to_string(),
            "No channels enabled. Please enable at least one channel."
        );
        assert_eq!(StartStatus::Started { channels: 3 }.to_string(), "Started generation on 3 channel(s)");
    }

    #[test]
    fn rejected_parameters_leave_state_unchanged() {
        let e = engine();
        let before = e.parameters();
        assert!(matches!(e.set_frequency_and_rate(0.0, 100_000.0), Err(EngineError::Param(ParamError::InvalidFrequency(_)))));
        assert!(matches!(e.set_frequency_and_rate(1_000.0, 1_500.0), Err(EngineError::Param(ParamError::Undersampled { .. }))));
        assert!(matches!(e.set_frequency_and_rate(1_000.0, 500_000.0), Err(EngineError::Param(ParamError::AboveCeiling { .. }))));
        assert_eq!(e.parameters(), before);
    }

    #[test]
    fn periods_longer_than_the_output_buffer_are_rejected() {
        let e = engine();
        let before = e.parameters();
        assert!(matches!(
            e.set_frequency_and_rate(1e-6, 1_000.0),
            Err(EngineError::Param(ParamError::PeriodTooLong { .. }))
        ));
        assert!(matches!(e.set_frequency(1e-7), Err(EngineError::Param(ParamError::PeriodTooLong { .. }))));
        assert_eq!(e.parameters(), before);
        // a million-sample period still fits
        assert!(e.set_frequency_and_rate(0.001, 1_000.0).is_ok());
    }

    #[test]
    fn set_frequency_uses_advisor() {
        let e = engine();
        let p = e.set_frequency(5_000.0).unwrap();
        assert_eq!(p.output_sample_rate, 200_000.0);
        assert_eq!(e.quality().unwrap(), QualityTier::Fair);
        assert_eq!(e.set_frequency(1_000.0).unwrap().output_sample_rate, 100_000.0);
        assert!(e.set_frequency(-1.0).is_err());
        // 150 kHz would need a clamped rate under the 2 samples/cycle floor
        assert!(e.set_frequency(150_000.0).is_err());
        assert_eq!(e.parameters().frequency, 1_000.0);
    }

    #[test]
    fn amplitude_validation_and_rounding() {
        let e = engine();
        let a = ChannelAddress::new("SV1", 0);
        assert!(e.set_channel_amplitude(&a, -1.0).is_err());
        assert!(e.set_channel_amplitude(&a, f64::NAN).is_err());
        assert!(e.set_channel_amplitude(&a, 10_000_001.0).is_err());
        assert!(e.set_channel_amplitude(&a, 1_234.6).unwrap());
        assert_eq!(e.channel(&a).unwrap().amplitude_uv, 1_235);
        assert!(!e.set_channel_amplitude(&ChannelAddress::new("SV9", 0), 5.0).unwrap());
    }

    #[test]
    fn start_without_channels_is_a_status() {
        let e = engine();
        assert_eq!(e.start().unwrap(), StartStatus::NoChannelsEnabled);
        assert_eq!(e.state(), EngineState::Idle);
        e.stop();
        e.stop();
    }

    #[test]
    fn start_stop_cycle() {
        let e = engine();
        e.set_channel_enabled(&ChannelAddress::new("SV1", 0), true);
        assert_eq!(e.start().unwrap(), StartStatus::Started { channels: 1 });
        assert!(e.is_running());
        assert_eq!(e.start().unwrap(), StartStatus::AlreadyRunning);
        e.stop();
        assert!(!e.is_running());
        assert_eq!(e.state(), EngineState::Idle);
        assert_eq!(e.driver().open_tasks(), 0);
    }
}
