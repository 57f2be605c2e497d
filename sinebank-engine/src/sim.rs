//! In-memory loopback driver.
//!
//! Each simulated card wires input channel *n* to output channel *n*: reading an
//! input task replays the card's running output buffer (resampled to the input
//! clock) plus a little uniform noise. Failures can be injected per card so the
//! engine's retry and isolation paths can be exercised without hardware.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use sinebank_core::dsp::peak_abs;

use crate::driver::{Driver, DriverError, DriverResult, SampleMode, VoltageRange};
use crate::registry::CardId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Output,
    Input,
}

/// Handle returned by [`SimDriver`]; the state lives in the driver.
#[derive(Debug)]
pub struct SimTask {
    id: u64,
    kind: TaskKind,
    card: CardId,
}

impl SimTask {
    #[inline] pub fn kind(&self) -> TaskKind { self.kind }
    #[inline] pub fn card(&self) -> &CardId { &self.card }
}

#[derive(Clone, Debug)]
struct TaskRecord {
    kind: TaskKind,
    card: CardId,
    channels: Vec<u16>,
    range: VoltageRange,
    rate: Option<f64>,
    mode: SampleMode,
    samples_per_channel: usize,
    regeneration: bool,
    buffers: Vec<Vec<f64>>,
    running: bool,
    /// Input sample clock position, in samples since start.
    cursor: u64,
}

/// Open output task as seen by the simulated hardware.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputInfo {
    pub card: CardId,
    pub channels: Vec<u16>,
    /// Peak of each written buffer, in bind order (i.e. the programmed amplitude).
    pub amplitudes: Vec<f64>,
    pub rate: Option<f64>,
    pub mode: SampleMode,
    pub samples_per_channel: usize,
    pub regeneration: bool,
    pub running: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputInfo {
    pub card: CardId,
    pub channels: Vec<u16>,
    pub rate: Option<f64>,
    pub mode: SampleMode,
    pub samples_per_channel: usize,
    pub running: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub outputs_created: usize,
    pub inputs_created: usize,
    pub closed: usize,
    pub writes: usize,
}

/// `None` remaining means fail forever.
#[derive(Copy, Clone, Debug)]
struct FailPlan {
    remaining: Option<usize>,
}

impl FailPlan {
    fn fire(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    tasks: HashMap<u64, TaskRecord>,
    output_faults: HashMap<CardId, FailPlan>,
    input_faults: HashMap<CardId, FailPlan>,
    read_timeouts: BTreeSet<CardId>,
    read_stalls: HashMap<CardId, Duration>,
    fatal_armed: bool,
    stats: SimStats,
}

#[derive(Debug)]
pub struct SimDriver {
    state: Mutex<SimState>,
    next_id: AtomicU64,
    cards: Option<BTreeSet<CardId>>,
    noise: f64,
}

impl Default for SimDriver {
    fn default() -> Self { Self::new() }
}

impl SimDriver {
    /// A driver that accepts any card name and adds no noise.
    pub fn new() -> Self {
        Self { state: Mutex::new(SimState::default()), next_id: AtomicU64::new(1), cards: None, noise: 0.0 }
    }

    /// Restrict the simulated chassis to these cards; others report `DeviceNotFound`.
    #[must_use]
    pub fn with_cards<I: IntoIterator<Item = CardId>>(mut self, cards: I) -> Self {
        self.cards = Some(cards.into_iter().collect());
        self
    }

    /// Uniform noise of ±`volts` added to every loopback sample.
    #[must_use]
    pub fn with_noise(mut self, volts: f64) -> Self {
        self.noise = volts.abs();
        self
    }

    // --- failure injection -------------------------------------------------------

    /// Fail every output start on `card` until [`heal`](Self::heal) is called.
    pub fn fail_outputs(&self, card: &CardId) {
        self.state.lock().output_faults.insert(card.clone(), FailPlan { remaining: None });
    }

    /// Fail the next `times` output starts on `card`.
    pub fn fail_outputs_times(&self, card: &CardId, times: usize) {
        self.state.lock().output_faults.insert(card.clone(), FailPlan { remaining: Some(times) });
    }

    /// Fail every input task creation on `card`.
    pub fn fail_inputs(&self, card: &CardId) {
        self.state.lock().input_faults.insert(card.clone(), FailPlan { remaining: None });
    }

    /// Make reads on `card` time out.
    pub fn time_out_reads(&self, card: &CardId) {
        self.state.lock().read_timeouts.insert(card.clone());
    }

    /// Make every read on `card` block for `delay` before answering, like a wedged
    /// driver call. The driver lock is not held while blocked.
    pub fn stall_reads(&self, card: &CardId, delay: Duration) {
        self.state.lock().read_stalls.insert(card.clone(), delay);
    }

    /// The next driver call of any kind fails with [`DriverError::Fatal`].
    pub fn arm_fatal(&self) {
        self.state.lock().fatal_armed = true;
    }

    pub fn heal(&self, card: &CardId) {
        let mut st = self.state.lock();
        st.output_faults.remove(card);
        st.input_faults.remove(card);
        st.read_timeouts.remove(card);
        st.read_stalls.remove(card);
    }

    // --- inspection --------------------------------------------------------------

    pub fn outputs(&self) -> Vec<OutputInfo> {
        let st = self.state.lock();
        let mut out: Vec<OutputInfo> = st
            .tasks
            .values()
            .filter(|t| t.kind == TaskKind::Output)
            .map(|t| OutputInfo {
                card: t.card.clone(),
                channels: t.channels.clone(),
                amplitudes: t.buffers.iter().map(|b| peak_abs(b)).collect(),
                rate: t.rate,
                mode: t.mode,
                samples_per_channel: t.samples_per_channel,
                regeneration: t.regeneration,
                running: t.running,
            })
            .collect();
        out.sort_by(|a, b| a.card.cmp(&b.card));
        out
    }

    pub fn inputs(&self) -> Vec<InputInfo> {
        let st = self.state.lock();
        let mut out: Vec<InputInfo> = st
            .tasks
            .values()
            .filter(|t| t.kind == TaskKind::Input)
            .map(|t| InputInfo {
                card: t.card.clone(),
                channels: t.channels.clone(),
                rate: t.rate,
                mode: t.mode,
                samples_per_channel: t.samples_per_channel,
                running: t.running,
            })
            .collect();
        out.sort_by(|a, b| a.card.cmp(&b.card));
        out
    }

    pub fn open_tasks(&self) -> usize { self.state.lock().tasks.len() }

    pub fn stats(&self) -> SimStats { self.state.lock().stats }

    // --- internals ---------------------------------------------------------------

    fn check_card(&self, card: &CardId) -> DriverResult<()> {
        match &self.cards {
            Some(known) if !known.contains(card) => Err(DriverError::DeviceNotFound(card.to_string())),
            _ => Ok(()),
        }
    }

    fn create(&self, card: &CardId, kind: TaskKind) -> DriverResult<SimTask> {
        self.check_card(card)?;
        let mut st = self.state.lock();
        take_fatal(&mut st)?;
        if kind == TaskKind::Input {
            if let Some(plan) = st.input_faults.get_mut(card) {
                if plan.fire() {
                    return Err(DriverError::Device(format!("{card}: input task creation failed")));
                }
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        st.tasks.insert(
            id,
            TaskRecord {
                kind,
                card: card.clone(),
                channels: Vec::new(),
                range: VoltageRange::default(),
                rate: None,
                mode: SampleMode::Continuous,
                samples_per_channel: 0,
                regeneration: false,
                buffers: Vec::new(),
                running: false,
                cursor: 0,
            },
        );
        match kind {
            TaskKind::Output => st.stats.outputs_created += 1,
            TaskKind::Input => st.stats.inputs_created += 1,
        }
        Ok(SimTask { id, kind, card: card.clone() })
    }

    fn with_record<T>(&self, task: &SimTask, f: impl FnOnce(&mut TaskRecord) -> DriverResult<T>) -> DriverResult<T> {
        let mut st = self.state.lock();
        take_fatal(&mut st)?;
        let rec = st
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DriverError::InvalidState(format!("task {} is closed", task.id)))?;
        f(rec)
    }

    fn bind(&self, task: &mut SimTask, card: &CardId, index: u16, range: VoltageRange, kind: TaskKind) -> DriverResult<()> {
        if task.kind != kind {
            return Err(DriverError::InvalidState(format!("cannot bind {kind:?} channel on {:?} task", task.kind)));
        }
        if *card != task.card {
            return Err(DriverError::Unsupported(format!("task on {} cannot bind {card}/{index}", task.card)));
        }
        self.with_record(task, |rec| {
            if rec.channels.contains(&index) {
                return Err(DriverError::InvalidState(format!("{card}/{index} bound twice")));
            }
            rec.channels.push(index);
            rec.range = range;
            Ok(())
        })
    }
}

fn take_fatal(st: &mut SimState) -> DriverResult<()> {
    if std::mem::take(&mut st.fatal_armed) {
        return Err(DriverError::Fatal("simulated chassis lost".into()));
    }
    Ok(())
}

impl Driver for SimDriver {
    type Task = SimTask;

    fn create_output_task(&self, card: &CardId) -> DriverResult<SimTask> {
        self.create(card, TaskKind::Output)
    }

    fn create_input_task(&self, card: &CardId) -> DriverResult<SimTask> {
        self.create(card, TaskKind::Input)
    }

    fn bind_output_channel(&self, task: &mut SimTask, card: &CardId, index: u16, range: VoltageRange) -> DriverResult<()> {
        self.bind(task, card, index, range, TaskKind::Output)
    }

    fn bind_input_channel(&self, task: &mut SimTask, card: &CardId, index: u16, range: VoltageRange) -> DriverResult<()> {
        self.bind(task, card, index, range, TaskKind::Input)
    }

    fn configure_clock(&self, task: &mut SimTask, rate: f64, mode: SampleMode, samples_per_channel: usize) -> DriverResult<()> {
        if !(rate.is_finite() && rate > 0.0) || samples_per_channel == 0 {
            return Err(DriverError::Unsupported(format!("clock {rate} Hz × {samples_per_channel}")));
        }
        self.with_record(task, |rec| {
            if rec.channels.is_empty() {
                return Err(DriverError::InvalidState("clock configured before any channel".into()));
            }
            rec.rate = Some(rate);
            rec.mode = mode;
            rec.samples_per_channel = samples_per_channel;
            Ok(())
        })
    }

    fn enable_regeneration(&self, task: &mut SimTask) -> DriverResult<()> {
        self.with_record(task, |rec| {
            rec.regeneration = true;
            Ok(())
        })
    }

    fn write(&self, task: &mut SimTask, buffers: &[Vec<f64>]) -> DriverResult<()> {
        let mut st = self.state.lock();
        take_fatal(&mut st)?;
        let rec = st
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DriverError::InvalidState(format!("task {} is closed", task.id)))?;
        if rec.kind != TaskKind::Output {
            return Err(DriverError::InvalidState("write on an input task".into()));
        }
        if buffers.len() != rec.channels.len() {
            return Err(DriverError::InvalidState(format!(
                "{} buffers for {} bound channels",
                buffers.len(),
                rec.channels.len()
            )));
        }
        if let Some(bad) = buffers.iter().find(|b| b.len() != rec.samples_per_channel) {
            return Err(DriverError::InvalidState(format!(
                "buffer of {} samples, clock sized for {}",
                bad.len(),
                rec.samples_per_channel
            )));
        }
        let full_scale = rec.range.full_scale();
        if buffers.iter().any(|b| peak_abs(b) > full_scale) {
            return Err(DriverError::Device(format!("{}: sample outside ±{full_scale} V", rec.card)));
        }
        rec.buffers = buffers.to_vec();
        st.stats.writes += 1;
        Ok(())
    }

    fn start(&self, task: &mut SimTask) -> DriverResult<()> {
        let mut st = self.state.lock();
        take_fatal(&mut st)?;
        if task.kind == TaskKind::Output {
            if let Some(plan) = st.output_faults.get_mut(&task.card) {
                if plan.fire() {
                    return Err(DriverError::Device(format!("{}: output task failed to start", task.card)));
                }
            }
        }
        let rec = st
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| DriverError::InvalidState(format!("task {} is closed", task.id)))?;
        if rec.rate.is_none() {
            return Err(DriverError::InvalidState("start before clock configuration".into()));
        }
        if rec.kind == TaskKind::Output && rec.buffers.is_empty() {
            return Err(DriverError::InvalidState("start before write".into()));
        }
        rec.running = true;
        rec.cursor = 0;
        Ok(())
    }

    fn stop(&self, task: &mut SimTask) -> DriverResult<()> {
        self.with_record(task, |rec| {
            rec.running = false;
            Ok(())
        })
    }

    fn close(&self, task: SimTask) -> DriverResult<()> {
        let mut st = self.state.lock();
        match st.tasks.remove(&task.id) {
            Some(_) => {
                st.stats.closed += 1;
                Ok(())
            }
            None => Err(DriverError::InvalidState(format!("task {} already closed", task.id))),
        }
    }

    fn read(&self, task: &mut SimTask, count: usize, _timeout: Duration) -> DriverResult<Vec<Vec<f64>>> {
        let stall = self.state.lock().read_stalls.get(&task.card).copied();
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        let mut st = self.state.lock();
        take_fatal(&mut st)?;
        if st.read_timeouts.contains(&task.card) {
            return Err(DriverError::Timeout);
        }
        let rec = st
            .tasks
            .get(&task.id)
            .ok_or_else(|| DriverError::InvalidState(format!("task {} is closed", task.id)))?;
        if rec.kind != TaskKind::Input || !rec.running {
            return Err(DriverError::InvalidState("read needs a running input task".into()));
        }
        let in_rate = rec.rate.unwrap_or(1.0);
        let cursor = rec.cursor;
        let channels = rec.channels.clone();

        let source = st
            .tasks
            .values()
            .find(|t| t.kind == TaskKind::Output && t.running && t.card == task.card);

        let mut rng = rand::thread_rng();
        let noise = self.noise;
        let mut batches = Vec::with_capacity(channels.len());
        for index in &channels {
            let wave = source.and_then(|o| {
                let k = o.channels.iter().position(|c| c == index)?;
                Some((o.buffers.get(k)?, o.rate.unwrap_or(in_rate)))
            });
            let batch = (0..count as u64)
                .map(|n| {
                    let clean = wave.map_or(0.0, |(buf, out_rate)| loopback_sample(buf, out_rate, in_rate, cursor + n));
                    if noise > 0.0 { clean + rng.gen_range(-noise..=noise) } else { clean }
                })
                .collect();
            batches.push(batch);
        }

        if let Some(rec) = st.tasks.get_mut(&task.id) {
            rec.cursor = cursor + count as u64;
        }
        Ok(batches)
    }
}

/// Value of a regenerating output buffer at input sample `n`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn loopback_sample(buf: &[f64], out_rate: f64, in_rate: f64, n: u64) -> f64 {
    if buf.is_empty() {
        return 0.0;
    }
    let out_index = ((n as f64) * out_rate / in_rate).floor() as u64;
    buf[(out_index % buf.len() as u64) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> CardId { CardId::from("SV1") }

    fn running_output(drv: &SimDriver, buffers: &[Vec<f64>]) -> SimTask {
        let mut t = drv.create_output_task(&card()).unwrap();
        for i in 0..buffers.len() {
            drv.bind_output_channel(&mut t, &card(), i as u16, VoltageRange::default()).unwrap();
        }
        drv.configure_clock(&mut t, 1000.0, SampleMode::Continuous, buffers[0].len()).unwrap();
        drv.enable_regeneration(&mut t).unwrap();
        drv.write(&mut t, buffers).unwrap();
        drv.start(&mut t).unwrap();
        t
    }

    #[test]
    fn loopback_replays_output_buffer() {
        let drv = SimDriver::new();
        let _out = running_output(&drv, &[vec![1.0, 2.0, 3.0, 4.0], vec![-1.0, -2.0, -3.0, -4.0]]);

        let mut inp = drv.create_input_task(&card()).unwrap();
        drv.bind_input_channel(&mut inp, &card(), 1, VoltageRange::default()).unwrap();
        drv.configure_clock(&mut inp, 1000.0, SampleMode::Continuous, 2000).unwrap();
        drv.start(&mut inp).unwrap();

        let first = drv.read(&mut inp, 6, Duration::from_millis(1)).unwrap();
        assert_eq!(first, vec![vec![-1.0, -2.0, -3.0, -4.0, -1.0, -2.0]]);
        let second = drv.read(&mut inp, 2, Duration::from_millis(1)).unwrap();
        assert_eq!(second, vec![vec![-3.0, -4.0]]);
    }

    #[test]
    fn write_must_match_bound_channels_and_clock() {
        let drv = SimDriver::new();
        let mut t = drv.create_output_task(&card()).unwrap();
        drv.bind_output_channel(&mut t, &card(), 0, VoltageRange::default()).unwrap();
        drv.configure_clock(&mut t, 1000.0, SampleMode::Continuous, 4).unwrap();
        assert!(matches!(drv.write(&mut t, &[vec![0.0; 4], vec![0.0; 4]]), Err(DriverError::InvalidState(_))));
        assert!(matches!(drv.write(&mut t, &[vec![0.0; 3]]), Err(DriverError::InvalidState(_))));
        assert!(matches!(drv.write(&mut t, &[vec![11.0; 4]]), Err(DriverError::Device(_))));
        drv.write(&mut t, &[vec![0.0; 4]]).unwrap();
    }

    #[test]
    fn injected_output_failure_fires_on_start_then_heals() {
        let drv = SimDriver::new();
        drv.fail_outputs_times(&card(), 1);
        let mut t = drv.create_output_task(&card()).unwrap();
        drv.bind_output_channel(&mut t, &card(), 0, VoltageRange::default()).unwrap();
        drv.configure_clock(&mut t, 1000.0, SampleMode::Continuous, 2).unwrap();
        drv.write(&mut t, &[vec![0.0, 0.0]]).unwrap();
        assert!(drv.start(&mut t).is_err());
        drv.start(&mut t).unwrap();
        drv.close(t).unwrap();
        assert_eq!(drv.open_tasks(), 0);
    }

    #[test]
    fn unknown_cards_are_not_found() {
        let drv = SimDriver::new().with_cards([card()]);
        assert!(matches!(drv.create_output_task(&CardId::from("SV9")), Err(DriverError::DeviceNotFound(_))));
    }

    #[test]
    fn fatal_is_one_shot() {
        let drv = SimDriver::new();
        drv.arm_fatal();
        assert!(matches!(drv.create_output_task(&card()), Err(DriverError::Fatal(_))));
        assert!(drv.create_output_task(&card()).is_ok());
    }

    #[test]
    fn noise_stays_within_bounds() {
        let drv = SimDriver::new().with_noise(0.01);
        let _out = running_output(&drv, &[vec![0.0, 0.0]]);
        let mut inp = drv.create_input_task(&card()).unwrap();
        drv.bind_input_channel(&mut inp, &card(), 0, VoltageRange::default()).unwrap();
        drv.configure_clock(&mut inp, 1000.0, SampleMode::Continuous, 100).unwrap();
        drv.start(&mut inp).unwrap();
        let batch = drv.read(&mut inp, 500, Duration::ZERO).unwrap();
        assert!(peak_abs(&batch[0]) <= 0.01);
    }
}
