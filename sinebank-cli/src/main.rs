//! Sinebank CLI: rate advice, device listing and live multi-channel generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sinebank_engine::{
    samples_per_cycle, AdvisorConfig, CardId, ChannelAddress, ClipState, Driver, EngineConfig, GenerationEngine,
    QualityTier, SampleRateAdvisor, SimDriver, StartStatus, Topology,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-card sine generator with live input monitoring")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recommend an output sample rate for a frequency and grade its quality.
    Advise {
        /// Output frequency, Hz.
        frequency: f64,
        /// Converter ceiling, S/s.
        #[arg(long, default_value_t = 200_000.0)]
        max_rate: f64,
    },
    /// List audio devices usable as cards by the `cpal` backend.
    ListDevices,
    /// Generate on the given channels and print live measurements.
    Run(RunArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-memory loopback, no hardware needed.
    Sim,
    /// Audio devices through CPAL; card names are device names.
    Cpal,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Output frequency, Hz.
    #[arg(long, default_value_t = 1_000.0)]
    frequency: f64,
    /// Output sample rate, S/s. Defaults to the advisor's recommendation.
    #[arg(long)]
    rate: Option<f64>,
    /// Converter ceiling used by the advisor, S/s.
    #[arg(long, default_value_t = 200_000.0)]
    max_rate: f64,
    /// Monitoring input rate, S/s. Defaults to 200 kS/s for `sim` and to the
    /// slowest enabled device's own capture rate for `cpal`.
    #[arg(long)]
    input_rate: Option<f64>,
    /// Amplitude applied to every enabled channel, µV.
    #[arg(long, default_value_t = 1_000.0)]
    amplitude_uv: f64,
    /// Channel to enable, as CARD:INDEX (repeatable).
    #[arg(long = "enable", value_name = "CARD:INDEX", required = true)]
    enable: Vec<ChannelAddress>,
    /// Card names making up the chassis. Defaults to SV1..SV4 for `sim`, and to the
    /// enabled cards for `cpal`.
    #[arg(long = "card", value_name = "NAME")]
    cards: Vec<String>,
    /// Stop after this many seconds; runs until killed otherwise.
    #[arg(long)]
    duration: Option<f64>,
    /// Seconds between status lines.
    #[arg(long, default_value_t = 1.0)]
    status_every: f64,
    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,
    /// Loopback noise for the `sim` backend, volts.
    #[arg(long, default_value_t = 1e-3)]
    noise: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Advise { frequency, max_rate } => advise(frequency, max_rate),
        Command::ListDevices => list_devices(),
        Command::Run(args) => run(&args),
    }
}

fn advisor(max_rate: f64) -> SampleRateAdvisor {
    SampleRateAdvisor::new(AdvisorConfig { max_output_rate: max_rate, ..AdvisorConfig::default() })
}

fn advise(frequency: f64, max_rate: f64) -> Result<()> {
    let advisor = advisor(max_rate);
    let rate = advisor.recommend(frequency)?;
    let spc = samples_per_cycle(frequency, rate)?;
    let tier = advisor.quality_tier(frequency, rate)?;
    println!("frequency:        {frequency} Hz");
    println!("recommended rate: {rate} S/s (ceiling {max_rate} S/s)");
    println!("samples/cycle:    {spc:.1} ({tier})");
    if let Err(e) = advisor.validate(frequency, rate) {
        println!("rejected:         {e}");
    } else if let Some(w) = quality_warning(tier, spc) {
        println!("{w}");
    }
    Ok(())
}

fn quality_warning(tier: QualityTier, spc: f64) -> Option<String> {
    match tier {
        QualityTier::Poor => Some(format!(
            "WARNING: low quality ({spc:.1} samples/cycle); increase the sample rate or lower the frequency"
        )),
        QualityTier::Fair => Some(format!("CAUTION: moderate quality ({spc:.1} samples/cycle)")),
        QualityTier::Good | QualityTier::Excellent => None,
    }
}

#[cfg(feature = "realtime")]
fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Host: {}", host.id().name());
    let devices = sinebank_engine::list_devices()?;
    if devices.is_empty() {
        println!("No devices found.");
    }
    for d in devices {
        println!("- {} (out: {} ch, in: {} ch)", d.name, d.output_channels, d.input_channels);
    }
    Ok(())
}

#[cfg(not(feature = "realtime"))]
fn list_devices() -> Result<()> {
    bail!("built without the `realtime` feature; no device backend available")
}

fn topology(args: &RunArgs) -> Topology {
    let mut cards: Vec<CardId> = if !args.cards.is_empty() {
        args.cards.iter().map(|c| CardId::from(c.as_str())).collect()
    } else if args.backend == Backend::Sim {
        Topology::default().cards
    } else {
        args.enable.iter().map(|a| a.card.clone()).collect()
    };
    cards.sort();
    cards.dedup();
    let widest = args.enable.iter().map(|a| a.index + 1).max().unwrap_or(0);
    Topology { cards, channels_per_card: widest.max(Topology::default().channels_per_card) }
}

const SIM_INPUT_RATE: f64 = 200_000.0;
const FALLBACK_DEVICE_RATE: f64 = 48_000.0;

fn input_rate(args: &RunArgs) -> f64 {
    match (args.input_rate, args.backend) {
        (Some(rate), _) => rate,
        (None, Backend::Sim) => SIM_INPUT_RATE,
        (None, Backend::Cpal) => device_input_rate(&args.enable),
    }
}

/// Audio devices rarely capture at DAQ rates; ask each enabled card for its own.
#[cfg(feature = "realtime")]
fn device_input_rate(enabled: &[ChannelAddress]) -> f64 {
    let rates = enabled.iter().filter_map(|a| match sinebank_engine::default_input_rate(&a.card) {
        Ok(rate) => Some(f64::from(rate)),
        Err(e) => {
            log::debug!("no default input rate for {}: {e}", a.card);
            None
        }
    });
    rates.reduce(f64::min).unwrap_or(FALLBACK_DEVICE_RATE)
}

#[cfg(not(feature = "realtime"))]
fn device_input_rate(_enabled: &[ChannelAddress]) -> f64 {
    FALLBACK_DEVICE_RATE
}

fn run(args: &RunArgs) -> Result<()> {
    let config = EngineConfig::default()
        .with_topology(topology(args))
        .with_advisor(AdvisorConfig { max_output_rate: args.max_rate, ..AdvisorConfig::default() })
        .with_max_input_rate(input_rate(args));
    match args.backend {
        Backend::Sim => drive(Arc::new(SimDriver::new().with_noise(args.noise)), config, args),
        #[cfg(feature = "realtime")]
        Backend::Cpal => drive(Arc::new(sinebank_engine::CpalDriver::new()), config, args),
        #[cfg(not(feature = "realtime"))]
        Backend::Cpal => bail!("built without the `realtime` feature"),
    }
}

fn drive<D: Driver>(driver: Arc<D>, config: EngineConfig, args: &RunArgs) -> Result<()> {
    let engine = GenerationEngine::new(driver, config);

    let params = match args.rate {
        Some(rate) => {
            engine.set_frequency_and_rate(args.frequency, rate).context("rejected frequency/rate")?;
            engine.parameters()
        }
        None => engine.set_frequency(args.frequency).context("rejected frequency")?,
    };
    let spc = engine.samples_per_cycle();
    if let Some(w) = quality_warning(engine.quality()?, spc) {
        log::warn!("{w}");
    }

    for addr in &args.enable {
        if !engine.set_channel_amplitude(addr, args.amplitude_uv)? || !engine.set_channel_enabled(addr, true) {
            bail!("{addr} is not part of the chassis");
        }
    }

    let status = engine.start()?;
    println!("{status}");
    if !matches!(status, StartStatus::Started { .. }) {
        return Ok(());
    }
    println!(
        "Output: {:.1} Hz @ {:.0} kS/s, {:.1} samples/cycle",
        params.frequency,
        params.output_sample_rate / 1_000.0,
        spc
    );

    let began = Instant::now();
    let every = Duration::try_from_secs_f64(args.status_every.max(0.05)).context("bad --status-every")?;
    let limit = args.duration.map(Duration::try_from_secs_f64).transpose().context("bad --duration")?;
    loop {
        std::thread::sleep(every);
        if !engine.is_running() {
            bail!("engine stopped unexpectedly; see log for the driver error");
        }
        println!("{}", status_line(&engine, &args.enable));
        if limit.is_some_and(|l| began.elapsed() >= l) {
            break;
        }
    }
    engine.stop();
    Ok(())
}

fn status_line<D: Driver>(engine: &GenerationEngine<D>, channels: &[ChannelAddress]) -> String {
    let mut line = format!("[{:.0} Hz]", engine.parameters().frequency);
    for addr in channels {
        let m = engine.measurement(addr);
        line.push_str(&format!(" | {addr}: rms {:.3} V peak {:.3} V", m.rms, m.peak));
        let clip = engine.clip_state(addr);
        if clip != ClipState::Clear {
            line.push_str(&format!(" ({})", clip.to_string().to_uppercase()));
        }
    }
    line
}
