//! Sound-card backend via CPAL.
//!
//! A "card" is an audio device addressed by its CPAL name; channel *n* is the
//! device's interleaved channel *n*. Output tasks loop the written period inside
//! the stream callback, which is exactly what regeneration asks for. Input tasks
//! capture into one lock-free ring per channel; the callback never blocks, and
//! `read` polls the rings until a batch is ready or the timeout passes.
//!
//! `cpal::Stream` is not `Send`, so every running stream lives on its own thread and
//! the task keeps only the channel that tells that thread to drop it.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::driver::{Driver, DriverError, DriverResult, SampleMode, VoltageRange};
use crate::registry::CardId;

/// How long `start` waits for the stream thread to report the stream playing.
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Sleep between polls of the capture rings while a read waits for data.
const CAPTURE_POLL: Duration = Duration::from_millis(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Output,
    Input,
}

/// One audio device as reported by the default host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub output_channels: u16,
    pub input_channels: u16,
}

/// Every device the default host can see, with its default channel counts.
pub fn list_devices() -> DriverResult<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let devices = host.devices().map_err(|e| DriverError::Device(e.to_string()))?;
    let mut out = Vec::new();
    for dev in devices {
        let Ok(name) = dev.name() else { continue };
        let output_channels = dev.default_output_config().map_or(0, |c| c.channels());
        let input_channels = dev.default_input_config().map_or(0, |c| c.channels());
        out.push(DeviceInfo { name, output_channels, input_channels });
    }
    Ok(out)
}

fn find_device(card: &CardId, dir: Direction) -> DriverResult<cpal::Device> {
    let host = cpal::default_host();
    let devices = match dir {
        Direction::Output => host.output_devices(),
        Direction::Input => host.input_devices(),
    }
    .map_err(|e| DriverError::Device(e.to_string()))?;
    for d in devices {
        if d.name().is_ok_and(|n| n == card.as_str()) {
            return Ok(d);
        }
    }
    Err(DriverError::DeviceNotFound(card.to_string()))
}

/// The rate `card` captures at by default, S/s.
pub fn default_input_rate(card: &CardId) -> DriverResult<u32> {
    let device = find_device(card, Direction::Input)?;
    let config = device.default_input_config().map_err(|e| DriverError::Device(e.to_string()))?;
    Ok(config.sample_rate().0)
}

fn build_error(e: cpal::BuildStreamError) -> DriverError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => DriverError::DeviceNotFound(e.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported | cpal::BuildStreamError::InvalidArgument => {
            DriverError::Unsupported(e.to_string())
        }
        other => DriverError::Device(other.to_string()),
    }
}

/// Reader half of the per-channel capture rings.
struct Capture {
    rings: Vec<Consumer<f64>>,
}

/// One ring per channel, each holding `capacity` samples. The producers go to the
/// input callback.
fn capture_rings(channels: usize, capacity: usize) -> (Vec<Producer<f64>>, Capture) {
    let (producers, rings) = (0..channels).map(|_| RingBuffer::new(capacity.max(1))).unzip();
    (producers, Capture { rings })
}

/// Push one frame, one value per channel. A frame that does not fit in every ring
/// is dropped whole so the channels stay aligned. Never blocks.
fn push_frame(producers: &mut [Producer<f64>], frame: impl Iterator<Item = f64>) -> bool {
    if producers.iter().any(|p| p.slots() == 0) {
        return false;
    }
    for (p, v) in producers.iter_mut().zip(frame) {
        let _ = p.push(v);
    }
    true
}

impl Capture {
    /// Whole frames ready on every channel.
    fn available(&self) -> usize {
        self.rings.iter().map(Consumer::slots).min().unwrap_or(0)
    }

    /// Up to `count` samples per channel; times out only if nothing at all arrived.
    fn take(&mut self, count: usize, timeout: Duration) -> DriverResult<Vec<Vec<f64>>> {
        let deadline = Instant::now() + timeout;
        while self.available() < count {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(CAPTURE_POLL));
        }
        let n = self.available().min(count);
        if n == 0 {
            return Err(DriverError::Timeout);
        }
        Ok(self.rings.iter_mut().map(|r| (0..n).map_while(|_| r.pop().ok()).collect()).collect())
    }
}

struct StreamThread {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    fn halt(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::warn!("[cpal] stream thread panicked");
        }
    }
}

/// Task handle for [`CpalDriver`].
pub struct CpalTask {
    card: CardId,
    dir: Direction,
    channels: Vec<u16>,
    range: VoltageRange,
    rate: Option<u32>,
    samples_per_channel: usize,
    regeneration: bool,
    buffers: Vec<Vec<f64>>,
    stream: Option<StreamThread>,
    capture: Option<Capture>,
}

impl CpalTask {
    fn new(card: &CardId, dir: Direction) -> Self {
        Self {
            card: card.clone(),
            dir,
            channels: Vec::new(),
            range: VoltageRange::default(),
            rate: None,
            samples_per_channel: 0,
            regeneration: false,
            buffers: Vec::new(),
            stream: None,
            capture: None,
        }
    }

    /// Interleaved frame width: enough device channels to reach the highest bound index.
    fn frame_width(&self) -> u16 {
        self.channels.iter().max().map_or(0, |m| m + 1)
    }

    fn stream_config(&self) -> DriverResult<cpal::StreamConfig> {
        let rate = self.rate.ok_or_else(|| DriverError::InvalidState("clock not configured".into()))?;
        Ok(cpal::StreamConfig {
            channels: self.frame_width(),
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        })
    }
}

/// Drives audio devices through the default CPAL host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDriver;

impl CpalDriver {
    pub fn new() -> Self { Self }
}

impl Driver for CpalDriver {
    type Task = CpalTask;

    fn create_output_task(&self, card: &CardId) -> DriverResult<CpalTask> {
        find_device(card, Direction::Output)?;
        Ok(CpalTask::new(card, Direction::Output))
    }

    fn create_input_task(&self, card: &CardId) -> DriverResult<CpalTask> {
        find_device(card, Direction::Input)?;
        Ok(CpalTask::new(card, Direction::Input))
    }

    fn bind_output_channel(&self, task: &mut CpalTask, card: &CardId, index: u16, range: VoltageRange) -> DriverResult<()> {
        bind(task, card, index, range, Direction::Output)
    }

    fn bind_input_channel(&self, task: &mut CpalTask, card: &CardId, index: u16, range: VoltageRange) -> DriverResult<()> {
        bind(task, card, index, range, Direction::Input)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn configure_clock(&self, task: &mut CpalTask, rate: f64, mode: SampleMode, samples_per_channel: usize) -> DriverResult<()> {
        if mode != SampleMode::Continuous {
            return Err(DriverError::Unsupported("audio devices only stream continuously".into()));
        }
        if !(rate.is_finite() && rate >= 1.0 && rate <= f64::from(u32::MAX)) || rate.fract() != 0.0 {
            return Err(DriverError::Unsupported(format!("sample rate {rate} Hz")));
        }
        if samples_per_channel == 0 {
            return Err(DriverError::Unsupported("empty buffer".into()));
        }
        task.rate = Some(rate as u32);
        task.samples_per_channel = samples_per_channel;
        Ok(())
    }

    fn enable_regeneration(&self, task: &mut CpalTask) -> DriverResult<()> {
        if task.dir != Direction::Output {
            return Err(DriverError::InvalidState("regeneration on an input task".into()));
        }
        task.regeneration = true;
        Ok(())
    }

    fn write(&self, task: &mut CpalTask, buffers: &[Vec<f64>]) -> DriverResult<()> {
        if task.dir != Direction::Output {
            return Err(DriverError::InvalidState("write on an input task".into()));
        }
        if buffers.len() != task.channels.len() || buffers.iter().any(|b| b.len() != task.samples_per_channel) {
            return Err(DriverError::InvalidState(format!(
                "{} buffers do not match {} channels × {} samples",
                buffers.len(),
                task.channels.len(),
                task.samples_per_channel
            )));
        }
        task.buffers = buffers.to_vec();
        Ok(())
    }

    fn start(&self, task: &mut CpalTask) -> DriverResult<()> {
        if task.stream.is_some() {
            return Ok(());
        }
        let config = task.stream_config()?;
        let (ready_tx, ready_rx) = bounded::<DriverResult<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let card = task.card.clone();
        let layout: Vec<usize> = task.channels.iter().map(|&c| usize::from(c)).collect();
        let full_scale = task.range.full_scale();

        let handle = match task.dir {
            Direction::Output => {
                if task.buffers.is_empty() {
                    return Err(DriverError::InvalidState("start before write".into()));
                }
                if !task.regeneration {
                    log::debug!("[cpal] {card}: regeneration not requested, looping anyway");
                }
                // Normalise to the device's [-1, 1] sample range once, off the audio thread.
                #[allow(clippy::cast_possible_truncation)]
                let normalised: Vec<Vec<f32>> = task
                    .buffers
                    .iter()
                    .map(|b| b.iter().map(|v| (v / full_scale).clamp(-1.0, 1.0) as f32).collect())
                    .collect();
                spawn_stream(format!("sinebank-{card}-out"), move |stop| {
                    run_output(&card, &config, normalised, layout, &ready_tx, &stop);
                }, stop_rx)?
            }
            Direction::Input => {
                let rate = config.sample_rate.0 as usize;
                let capacity = task.samples_per_channel.max(rate);
                let (producers, capture) = capture_rings(layout.len(), capacity);
                task.capture = Some(capture);
                spawn_stream(format!("sinebank-{card}-in"), move |stop| {
                    run_input(&card, &config, layout, full_scale, producers, &ready_tx, &stop);
                }, stop_rx)?
            }
        };

        let thread = StreamThread { stop: stop_tx, handle };
        match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(Ok(())) => {
                task.stream = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                thread.halt();
                Err(e)
            }
            Err(_) => {
                thread.halt();
                Err(DriverError::Timeout)
            }
        }
    }

    fn stop(&self, task: &mut CpalTask) -> DriverResult<()> {
        if let Some(thread) = task.stream.take() {
            thread.halt();
        }
        Ok(())
    }

    fn close(&self, mut task: CpalTask) -> DriverResult<()> {
        self.stop(&mut task)
    }

    fn read(&self, task: &mut CpalTask, count: usize, timeout: Duration) -> DriverResult<Vec<Vec<f64>>> {
        match (&mut task.capture, &task.stream) {
            (Some(capture), Some(_)) => capture.take(count, timeout),
            _ => Err(DriverError::InvalidState("read needs a running input task".into())),
        }
    }
}

fn bind(task: &mut CpalTask, card: &CardId, index: u16, range: VoltageRange, dir: Direction) -> DriverResult<()> {
    if task.dir != dir {
        return Err(DriverError::InvalidState(format!("cannot bind {dir:?} channel on {:?} task", task.dir)));
    }
    if *card != task.card {
        return Err(DriverError::Unsupported(format!("task on {} cannot bind {card}/{index}", task.card)));
    }
    if task.channels.contains(&index) {
        return Err(DriverError::InvalidState(format!("{card}/{index} bound twice")));
    }
    task.channels.push(index);
    task.range = range;
    Ok(())
}

fn spawn_stream(
    name: String,
    body: impl FnOnce(Receiver<()>) + Send + 'static,
    stop_rx: Receiver<()>,
) -> DriverResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || body(stop_rx))
        .map_err(|e| DriverError::Device(format!("spawn stream thread: {e}")))
}

fn run_output(
    card: &CardId,
    config: &cpal::StreamConfig,
    buffers: Vec<Vec<f32>>,
    layout: Vec<usize>,
    ready: &Sender<DriverResult<()>>,
    stop: &Receiver<()>,
) {
    let opened = find_device(card, Direction::Output).and_then(|device| {
        let format = device
            .default_output_config()
            .map_err(|e| DriverError::Device(e.to_string()))?
            .sample_format();
        let stream = match format {
            cpal::SampleFormat::F32 => build_output::<f32>(&device, config, buffers, layout, card),
            cpal::SampleFormat::I16 => build_output::<i16>(&device, config, buffers, layout, card),
            cpal::SampleFormat::U16 => build_output::<u16>(&device, config, buffers, layout, card),
            other => Err(DriverError::Unsupported(format!("sample format {other:?}"))),
        }?;
        stream.play().map_err(|e| DriverError::Device(e.to_string()))?;
        Ok(stream)
    });
    park(opened, ready, stop);
}

fn run_input(
    card: &CardId,
    config: &cpal::StreamConfig,
    layout: Vec<usize>,
    full_scale: f64,
    producers: Vec<Producer<f64>>,
    ready: &Sender<DriverResult<()>>,
    stop: &Receiver<()>,
) {
    let opened = find_device(card, Direction::Input).and_then(|device| {
        let format = device
            .default_input_config()
            .map_err(|e| DriverError::Device(e.to_string()))?
            .sample_format();
        let stream = match format {
            cpal::SampleFormat::F32 => build_input::<f32>(&device, config, layout, full_scale, producers, card),
            cpal::SampleFormat::I16 => build_input::<i16>(&device, config, layout, full_scale, producers, card),
            cpal::SampleFormat::U16 => build_input::<u16>(&device, config, layout, full_scale, producers, card),
            other => Err(DriverError::Unsupported(format!("sample format {other:?}"))),
        }?;
        stream.play().map_err(|e| DriverError::Device(e.to_string()))?;
        Ok(stream)
    });
    park(opened, ready, stop);
}

/// Report the open result, then hold the stream until told to stop.
fn park(opened: DriverResult<cpal::Stream>, ready: &Sender<DriverResult<()>>, stop: &Receiver<()>) {
    match opened {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            // A dropped sender also ends the wait.
            let _ = stop.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffers: Vec<Vec<f32>>,
    layout: Vec<usize>,
    card: &CardId,
) -> DriverResult<cpal::Stream>
where
    T: cpal::Sample + cpal::FromSample<f32> + cpal::SizedSample + Send + 'static,
{
    let width = usize::from(config.channels).max(1);
    let period = buffers.first().map_or(1, Vec::len).max(1);
    let mut pos = 0usize;
    let tag = card.clone();
    device
        .build_output_stream(
            config,
            move |out: &mut [T], _| {
                for frame in out.chunks_mut(width) {
                    frame.fill(T::EQUILIBRIUM);
                    for (buf, &ch) in buffers.iter().zip(&layout) {
                        if let (Some(slot), Some(&v)) = (frame.get_mut(ch), buf.get(pos)) {
                            *slot = T::from_sample(v);
                        }
                    }
                    pos = (pos + 1) % period;
                }
            },
            move |e| log::warn!("[cpal] {tag}: output stream error: {e}"),
            None,
        )
        .map_err(build_error)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    layout: Vec<usize>,
    full_scale: f64,
    mut producers: Vec<Producer<f64>>,
    card: &CardId,
) -> DriverResult<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let width = usize::from(config.channels).max(1);
    let tag = card.clone();
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                for frame in data.chunks(width) {
                    let values = layout.iter().map(|&ch| {
                        let s = frame.get(ch).map_or(0.0, |&s| <f32 as cpal::Sample>::from_sample(s));
                        f64::from(s) * full_scale
                    });
                    // a full ring means the reader fell behind; drop the frame
                    push_frame(&mut producers, values);
                }
            },
            move |e| log::warn!("[cpal] {tag}: input stream error: {e}"),
            None,
        )
        .map_err(build_error)
}
