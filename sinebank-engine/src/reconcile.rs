//! One pass of the worker: diff a control snapshot against the live hardware tasks
//! and make the hardware match.
//!
//! The [`Reconciler`] owns every task handle. It has no clock and no thread of its
//! own; the engine's worker calls [`Reconciler::step`] once per poll interval, and
//! tests call it directly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use sinebank_core::dsp::uv_to_volts;
use sinebank_core::synth::{period_samples, synthesize};

use crate::driver::{Driver, DriverError, DriverResult, ErrorClass, SampleMode, VoltageRange};
use crate::registry::{CardId, ChannelAddress, ChannelDrive, GenerationParameters, Snapshot};
use crate::scope::ScopeBuffer;

/// Hardware-facing knobs the reconciler needs from the engine configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileSettings {
    pub output_range: VoltageRange,
    pub input_range: VoltageRange,
    pub max_input_rate: f64,
    pub input_buffer_seconds: f64,
    pub read_batch: usize,
    pub read_timeout: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            output_range: VoltageRange::BIPOLAR_10V,
            input_range: VoltageRange::BIPOLAR_10V,
            max_input_rate: 200_000.0,
            input_buffer_seconds: 2.0,
            read_batch: 1_000,
            read_timeout: Duration::from_millis(10),
        }
    }
}

impl ReconcileSettings {
    /// Input buffer length per channel, never shorter than one read batch.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn input_buffer_samples(&self) -> usize {
        let n = (self.max_input_rate * self.input_buffer_seconds).ceil() as usize;
        n.max(self.read_batch).max(1)
    }
}

/// What a card's output task was last programmed with.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedOutput {
    pub params: GenerationParameters,
    /// Bound channels in bind order (ascending index) with their amplitudes.
    pub drives: Vec<ChannelDrive>,
}

struct OutputHandle<T> {
    task: T,
    applied: AppliedOutput,
}

struct InputHandle<T> {
    task: T,
    channels: Vec<u16>,
}

/// Outcome of one [`Reconciler::step`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepReport {
    /// Cards whose output task was created or replaced this pass.
    pub configured: Vec<CardId>,
    /// Cards whose output task was torn down because nothing is enabled on them.
    pub torn_down: Vec<CardId>,
    /// Cards whose output could not be brought up; retried next pass.
    pub failed: Vec<CardId>,
    pub samples_acquired: usize,
}

impl StepReport {
    pub fn changed(&self) -> bool { !self.configured.is_empty() || !self.torn_down.is_empty() }
}

pub struct Reconciler<D: Driver> {
    driver: Arc<D>,
    settings: ReconcileSettings,
    outputs: BTreeMap<CardId, OutputHandle<D::Task>>,
    inputs: BTreeMap<CardId, InputHandle<D::Task>>,
    /// (card, task kind) pairs currently failing, so a persistent fault warns once
    /// instead of every pass.
    failing: BTreeSet<(CardId, &'static str)>,
}

impl<D: Driver> Reconciler<D> {
    pub fn new(driver: Arc<D>, settings: ReconcileSettings) -> Self {
        Self { driver, settings, outputs: BTreeMap::new(), inputs: BTreeMap::new(), failing: BTreeSet::new() }
    }

    pub fn settings(&self) -> &ReconcileSettings { &self.settings }

    pub fn output_cards(&self) -> Vec<CardId> { self.outputs.keys().cloned().collect() }

    pub fn input_cards(&self) -> Vec<CardId> { self.inputs.keys().cloned().collect() }

    pub fn applied(&self, card: &CardId) -> Option<&AppliedOutput> {
        self.outputs.get(card).map(|h| &h.applied)
    }

    pub fn is_idle(&self) -> bool { self.outputs.is_empty() && self.inputs.is_empty() }

    /// Bring hardware in line with `snapshot`, then acquire one batch per input.
    ///
    /// Per-card failures are logged and retried on the next call. Only a
    /// [`ErrorClass::Fatal`] driver error is returned; the caller is expected to
    /// [`shutdown`](Self::shutdown) afterwards.
    pub fn step(&mut self, snapshot: &Snapshot, scope: &ScopeBuffer) -> DriverResult<StepReport> {
        let mut report = StepReport::default();
        let wanted = snapshot.by_card();

        // Cards with nothing enabled lose their tasks.
        let idle: Vec<CardId> = self.outputs.keys().filter(|c| !wanted.contains_key(*c)).cloned().collect();
        for card in idle {
            self.teardown(&card);
            log::info!("[engine] {card}: no channels enabled, output closed");
            report.torn_down.push(card);
        }
        self.failing.retain(|(c, _)| wanted.contains_key(c));

        for (card, drives) in &wanted {
            let applied = AppliedOutput { params: snapshot.params, drives: drives.clone() };
            if self.outputs.get(card).is_some_and(|h| h.applied == applied) {
                continue;
            }
            if let Some(old) = self.outputs.remove(card) {
                log::debug!("[engine] {card}: settings changed, replacing output task");
                self.release(card, old.task, "output");
            }
            match self.open_output(card, &applied) {
                Ok(task) => {
                    if self.failing.remove(&(card.clone(), "output")) {
                        log::info!("[engine] {card}: output recovered");
                    }
                    log::info!(
                        "[engine] {card}: generating {} Hz @ {} S/s on {} channel(s)",
                        applied.params.frequency,
                        applied.params.output_sample_rate,
                        applied.drives.len()
                    );
                    self.outputs.insert(card.clone(), OutputHandle { task, applied });
                    report.configured.push(card.clone());
                }
                Err(e) => {
                    self.classify(card, "output", e)?;
                    report.failed.push(card.clone());
                }
            }
        }

        self.sync_inputs()?;
        report.samples_acquired = self.acquire(scope)?;
        Ok(report)
    }

    /// Stop and close every task. Returns how many handles were released.
    pub fn shutdown(&mut self) -> usize {
        let mut released = 0;
        for (card, h) in std::mem::take(&mut self.inputs) {
            self.release(&card, h.task, "input");
            released += 1;
        }
        for (card, h) in std::mem::take(&mut self.outputs) {
            self.release(&card, h.task, "output");
            released += 1;
        }
        self.failing.clear();
        released
    }

    /// Route a per-card failure: fatal ones propagate, the rest are logged once.
    fn classify(&mut self, card: &CardId, what: &'static str, e: DriverError) -> DriverResult<()> {
        match e.class() {
            ErrorClass::Fatal => Err(e),
            ErrorClass::Configuration | ErrorClass::Transient => {
                if self.failing.insert((card.clone(), what)) {
                    log::warn!("[engine] {card}: {what} failed: {e}; retrying");
                } else {
                    log::debug!("[engine] {card}: {what} still failing: {e}");
                }
                Ok(())
            }
        }
    }

    fn teardown(&mut self, card: &CardId) {
        if let Some(h) = self.inputs.remove(card) {
            self.release(card, h.task, "input");
        }
        if let Some(h) = self.outputs.remove(card) {
            self.release(card, h.task, "output");
        }
    }

    /// Best-effort stop + close; errors are logged and swallowed.
    fn release(&self, card: &CardId, mut task: D::Task, what: &str) {
        if let Err(e) = self.driver.stop(&mut task) {
            log::debug!("[engine] {card}: stopping {what} task: {e}");
        }
        if let Err(e) = self.driver.close(task) {
            log::warn!("[engine] {card}: closing {what} task: {e}");
        }
    }

    fn open_output(&self, card: &CardId, applied: &AppliedOutput) -> DriverResult<D::Task> {
        let GenerationParameters { frequency, output_sample_rate: rate } = applied.params;
        // Buffers first: nothing touches hardware if the parameters cannot be synthesized.
        let samples = period_samples(frequency, rate).map_err(|e| DriverError::Unsupported(e.to_string()))?;
        let buffers = applied
            .drives
            .iter()
            .map(|d| {
                #[allow(clippy::cast_precision_loss)]
                let volts = uv_to_volts(d.amplitude_uv as f64);
                synthesize(frequency, volts, rate)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DriverError::Unsupported(e.to_string()))?;

        let driver = &*self.driver;
        let mut task = driver.create_output_task(card)?;
        let programmed = (|| {
            for d in &applied.drives {
                driver.bind_output_channel(&mut task, card, d.index, self.settings.output_range)?;
            }
            driver.configure_clock(&mut task, rate, SampleMode::Continuous, samples)?;
            driver.enable_regeneration(&mut task)?;
            driver.write(&mut task, &buffers)?;
            driver.start(&mut task)
        })();
        match programmed {
            Ok(()) => Ok(task),
            Err(e) => {
                if let Err(close) = driver.close(task) {
                    log::debug!("[engine] {card}: closing half-built output task: {close}");
                }
                Err(e)
            }
        }
    }

    /// Keep one input task per active output, bound to the same channel indices.
    fn sync_inputs(&mut self) -> DriverResult<()> {
        let orphaned: Vec<CardId> = self.inputs.keys().filter(|c| !self.outputs.contains_key(*c)).cloned().collect();
        for card in orphaned {
            if let Some(h) = self.inputs.remove(&card) {
                self.release(&card, h.task, "input");
            }
        }

        let wanted: Vec<(CardId, Vec<u16>)> = self
            .outputs
            .iter()
            .map(|(card, h)| (card.clone(), h.applied.drives.iter().map(|d| d.index).collect()))
            .collect();
        for (card, channels) in wanted {
            if self.inputs.get(&card).is_some_and(|h| h.channels == channels) {
                continue;
            }
            if let Some(old) = self.inputs.remove(&card) {
                log::debug!("[engine] {card}: monitored channels changed, replacing input task");
                self.release(&card, old.task, "input");
            }
            match self.open_input(&card, &channels) {
                Ok(task) => {
                    if self.failing.remove(&(card.clone(), "input")) {
                        log::info!("[engine] {card}: input recovered");
                    }
                    log::debug!("[engine] {card}: monitoring {} channel(s)", channels.len());
                    self.inputs.insert(card, InputHandle { task, channels });
                }
                // Monitoring is optional: the output keeps running either way.
                Err(e) => self.classify(&card, "input", e)?,
            }
        }
        Ok(())
    }

    fn open_input(&self, card: &CardId, channels: &[u16]) -> DriverResult<D::Task> {
        let driver = &*self.driver;
        let mut task = driver.create_input_task(card)?;
        let programmed = (|| {
            for &index in channels {
                driver.bind_input_channel(&mut task, card, index, self.settings.input_range)?;
            }
            driver.configure_clock(
                &mut task,
                self.settings.max_input_rate,
                SampleMode::Continuous,
                self.settings.input_buffer_samples(),
            )?;
            driver.start(&mut task)
        })();
        match programmed {
            Ok(()) => Ok(task),
            Err(e) => {
                if let Err(close) = driver.close(task) {
                    log::debug!("[engine] {card}: closing half-built input task: {close}");
                }
                Err(e)
            }
        }
    }

    fn acquire(&mut self, scope: &ScopeBuffer) -> DriverResult<usize> {
        let mut total = 0;
        for (card, h) in &mut self.inputs {
            match self.driver.read(&mut h.task, self.settings.read_batch, self.settings.read_timeout) {
                Ok(batches) => {
                    for (&index, batch) in h.channels.iter().zip(&batches) {
                        if batch.is_empty() {
                            continue;
                        }
                        scope.push(&ChannelAddress { card: card.clone(), index }, batch);
                        total += batch.len();
                    }
                }
                Err(e) if e.is_timeout() => log::trace!("[engine] {card}: read timed out"),
                Err(e) if e.class() == ErrorClass::Fatal => return Err(e),
                Err(e) => log::warn!("[engine] {card}: read failed: {e}"),
            }
        }
        Ok(total)
    }
}

impl<D: Driver> Drop for Reconciler<D> {
    fn drop(&mut self) {
        if !self.is_idle() {
            let n = self.shutdown();
            log::debug!("[engine] released {n} task(s) on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelConfig, ChannelRegistry, ControlState, Topology};
    use crate::sim::SimDriver;

    struct Rig {
        driver: Arc<SimDriver>,
        rec: Reconciler<SimDriver>,
        control: ControlState,
        scope: ScopeBuffer,
    }

    impl Rig {
        fn new() -> Self {
            let driver = Arc::new(SimDriver::new());
            let settings = ReconcileSettings { max_input_rate: 100_000.0, input_buffer_seconds: 0.1, ..Default::default() };
            Self {
                rec: Reconciler::new(Arc::clone(&driver), settings),
                driver,
                control: ControlState {
                    registry: ChannelRegistry::new(&Topology::default(), ChannelConfig::default()),
                    params: GenerationParameters::default(),
                },
                scope: ScopeBuffer::new(5_000),
            }
        }

        fn enable(&mut self, card: &str, index: u16, uv: i64) {
            let a = ChannelAddress::new(card, index);
            self.control.registry.set_enabled(&a, true);
            self.control.registry.set_amplitude(&a, uv);
        }

        fn disable(&mut self, card: &str, index: u16) {
            self.control.registry.set_enabled(&ChannelAddress::new(card, index), false);
        }

        fn step(&mut self) -> StepReport {
            let snap = self.control.snapshot();
            self.rec.step(&snap, &self.scope).unwrap()
        }
    }

    fn card(s: &str) -> CardId { CardId::from(s) }

    #[test]
    fn one_output_per_card_with_enabled_channels() {
        let mut rig = Rig::new();
        rig.enable("SV1", 1, 2_000_000);
        rig.enable("SV1", 0, 1_000_000);
        rig.enable("SV3", 0, 500_000);
        let report = rig.step();
        assert_eq!(report.configured, vec![card("SV1"), card("SV3")]);

        let outs = rig.driver.outputs();
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].card, card("SV1"));
        assert_eq!(outs[0].channels, vec![0, 1]);
        assert!((outs[0].amplitudes[0] - 1.0).abs() < 1e-9);
        assert!((outs[0].amplitudes[1] - 2.0).abs() < 1e-9);
        assert!(outs.iter().all(|o| o.running && o.regeneration));
        assert_eq!(outs[0].samples_per_channel, 100);
        assert_eq!(outs[0].rate, Some(100_000.0));
    }

    #[test]
    fn unchanged_snapshot_touches_nothing() {
        let mut rig = Rig::new();
        rig.enable("SV2", 0, 1_000);
        rig.step();
        let before = rig.driver.stats();
        let report = rig.step();
        assert!(!report.changed());
        assert_eq!(rig.driver.stats().outputs_created, before.outputs_created);
        assert_eq!(rig.driver.stats().closed, before.closed);
    }

    #[test]
    fn amplitude_change_replaces_output_but_keeps_input() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000_000);
        rig.step();
        let inputs_before = rig.driver.stats().inputs_created;

        rig.enable("SV1", 0, 3_000_000);
        let report = rig.step();
        assert_eq!(report.configured, vec![card("SV1")]);
        assert_eq!(rig.driver.outputs().len(), 1);
        assert!((rig.driver.outputs()[0].amplitudes[0] - 3.0).abs() < 1e-9);
        assert_eq!(rig.driver.stats().inputs_created, inputs_before);
    }

    #[test]
    fn frequency_change_resizes_buffer() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000);
        rig.step();
        rig.control.params = GenerationParameters { frequency: 250.0, output_sample_rate: 50_000.0 };
        rig.step();
        let out = &rig.driver.outputs()[0];
        assert_eq!(out.samples_per_channel, 200);
        assert_eq!(out.rate, Some(50_000.0));
    }

    #[test]
    fn disabling_last_channel_closes_card() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000);
        rig.enable("SV2", 1, 1_000);
        rig.step();
        assert_eq!(rig.driver.open_tasks(), 4);

        rig.disable("SV2", 1);
        let report = rig.step();
        assert_eq!(report.torn_down, vec![card("SV2")]);
        assert_eq!(rig.rec.output_cards(), vec![card("SV1")]);
        assert_eq!(rig.rec.input_cards(), vec![card("SV1")]);
        assert_eq!(rig.driver.open_tasks(), 2);
    }

    #[test]
    fn failing_card_is_isolated_and_retried() {
        let mut rig = Rig::new();
        for c in ["SV1", "SV2", "SV3"] {
            rig.enable(c, 0, 1_000);
        }
        rig.driver.fail_outputs(&card("SV2"));

        let report = rig.step();
        assert_eq!(report.failed, vec![card("SV2")]);
        assert_eq!(rig.rec.output_cards(), vec![card("SV1"), card("SV3")]);
        // the half-built task was released, not leaked
        assert_eq!(rig.driver.outputs().len(), 2);

        rig.step();
        assert_eq!(rig.rec.output_cards().len(), 2);

        rig.driver.heal(&card("SV2"));
        let report = rig.step();
        assert_eq!(report.configured, vec![card("SV2")]);
        assert_eq!(rig.rec.output_cards().len(), 3);
    }

    #[test]
    fn input_failure_never_blocks_output() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000);
        rig.enable("SV2", 0, 1_000);
        rig.driver.fail_inputs(&card("SV1"));
        rig.step();
        assert_eq!(rig.rec.output_cards(), vec![card("SV1"), card("SV2")]);
        assert_eq!(rig.rec.input_cards(), vec![card("SV2")]);
    }

    #[test]
    fn persistent_input_failure_is_tracked_once_and_clears_on_recovery() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000);
        rig.driver.fail_inputs(&card("SV1"));
        for _ in 0..3 {
            rig.step();
        }
        assert_eq!(rig.rec.failing.len(), 1);
        assert!(rig.rec.failing.contains(&(card("SV1"), "input")));
        assert!(rig.rec.input_cards().is_empty());

        rig.driver.heal(&card("SV1"));
        rig.step();
        assert!(rig.rec.failing.is_empty());
        assert_eq!(rig.rec.input_cards(), vec![card("SV1")]);
    }

    #[test]
    fn loopback_lands_in_scope() {
        let mut rig = Rig::new();
        rig.enable("SV4", 1, 2_000_000);
        let report = rig.step();
        assert_eq!(report.samples_acquired, 1_000);

        let addr = ChannelAddress::new("SV4", 1);
        assert_eq!(rig.scope.len(&addr), 1_000);
        let m = rig.scope.measurement(&addr);
        assert!((m.peak - 2.0).abs() < 1e-3);
        assert!((m.rms - 2.0 / 2f64.sqrt()).abs() < 0.02);
    }

    #[test]
    fn read_timeouts_are_quiet() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000);
        rig.driver.time_out_reads(&card("SV1"));
        let report = rig.step();
        assert_eq!(report.samples_acquired, 0);
        assert_eq!(rig.rec.output_cards().len(), 1);
    }

    #[test]
    fn fatal_error_propagates_and_shutdown_releases_everything() {
        let mut rig = Rig::new();
        rig.enable("SV1", 0, 1_000);
        rig.step();
        rig.enable("SV2", 0, 1_000);
        rig.driver.arm_fatal();
        let snap = rig.control.snapshot();
        let err = rig.rec.step(&snap, &rig.scope).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);

        assert_eq!(rig.rec.shutdown(), 2);
        assert!(rig.rec.is_idle());
        assert_eq!(rig.driver.open_tasks(), 0);
    }
}
