use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use waveform_envelope_core::{AppConfig, Engine, Snapshot};

fn main() -> waveform_envelope_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live {
            config,
            seconds,
            report_every,
        } => run_live(config.as_deref(), seconds, report_every),
        Commands::Check { config } => run_check(&config),
        Commands::DefaultConfig => run_default_config(),
    }
}

fn load_config(path: Option<&Path>) -> waveform_envelope_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_path(path),
        None => Ok(AppConfig::default()),
    }
}

fn run_live(
    config: Option<&Path>,
    seconds: f64,
    report_every: u64,
) -> waveform_envelope_core::Result<()> {
    let config = load_config(config)?;
    tracing::info!(
        channels = config.channels.len(),
        tick_rate_hz = config.engine.tick_rate_hz,
        seconds,
        "starting live analysis"
    );

    let mut engine = Engine::from_config(&config)?;
    let updates = engine.subscribe();
    engine.start()?;

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0).min(1e9));
    let report_every = report_every.max(1);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match updates.recv_timeout(remaining) {
            Ok(snapshot) if snapshot.generation() % report_every == 0 => report(&snapshot),
            Ok(_) => {}
            Err(_) => break,
        }
    }

    engine.stop();
    match engine.current_snapshot() {
        Ok(snapshot) => report(&snapshot),
        Err(err) => tracing::warn!(%err, "no analysis results were produced"),
    }
    Ok(())
}

fn report(snapshot: &Snapshot) {
    for view in snapshot.channels() {
        tracing::info!(
            generation = snapshot.generation(),
            channel = %view.id,
            envelope = view.envelope,
            samples = view.samples.len(),
            stale = view.stale,
            "channel"
        );
    }
    if let Some(bounds) = snapshot.bounds() {
        let peak = bounds.upper.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let trough = bounds.lower.iter().copied().fold(f32::INFINITY, f32::min);
        tracing::info!(
            generation = snapshot.generation(),
            sample_rate = bounds.sample_rate,
            peak,
            trough,
            "cross-channel bounds"
        );
    }
    let stale: Vec<String> = snapshot.stale_channels().map(|id| id.to_string()).collect();
    if !stale.is_empty() {
        tracing::warn!(
            generation = snapshot.generation(),
            age_ms = snapshot.published_at().elapsed().as_secs_f64() * 1_000.0,
            channels = %stale.join(","),
            "stale channels"
        );
    }
}

fn run_check(path: &PathBuf) -> waveform_envelope_core::Result<()> {
    let config = AppConfig::from_path(path)?;
    tracing::info!(
        ?path,
        channels = config.channels.len(),
        "configuration is valid"
    );
    Ok(())
}

fn run_default_config() -> waveform_envelope_core::Result<()> {
    println!("{}", AppConfig::default().to_json()?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-channel waveform envelope analyser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the analysis loop and log envelopes as they are published.
    Live {
        /// JSON configuration file. Built-in defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to run before stopping.
        #[arg(short, long, default_value_t = 2.0)]
        seconds: f64,
        /// Log every n-th generation.
        #[arg(long, default_value_t = 30)]
        report_every: u64,
    },
    /// Validate a configuration file without starting the engine.
    Check {
        config: PathBuf,
    },
    /// Print the built-in configuration as JSON.
    DefaultConfig,
}
