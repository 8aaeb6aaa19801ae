//! scan_daq CLI
//!
//! Runs raster scans and point-tracking sessions against the simulated
//! confocal stage and photon counter.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use scan_daq::config::DaqConfig;
use scan_daq::core::{GridShape, Vector2};
use scan_daq::correlation::CorrelationHistogram;
use scan_daq::engine::{LoggingOwner, Schedule, TaskEngine};
use scan_daq::hardware::{SimulatedCounter, SimulatedStage};
use scan_daq::scan::{DriftEstimate, Mode, RasterMap, RateSampler, ScanEvent, ScanOrchestrator};

#[derive(Parser)]
#[command(name = "scan_daq")]
#[command(about = "Raster scanning and drift-corrected tracking on a simulated confocal microscope", long_about = None)]
struct Cli {
    /// TOML configuration file (SCAN_DAQ_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire one raster map and print it
    Scan {
        /// Number of rows (y direction)
        #[arg(long, default_value = "15")]
        rows: usize,
        /// Number of columns (x direction)
        #[arg(long, default_value = "15")]
        cols: usize,
        /// Cell spacing in micrometres
        #[arg(long, default_value = "0.1")]
        step: f64,
        /// Map centre, x (µm)
        #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
        x: f64,
        /// Map centre, y (µm)
        #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
        y: f64,
        /// Print the map as JSON
        #[arg(long)]
        json: bool,
    },
    /// Dwell on a point with periodic drift correction
    Track {
        /// Target x (µm)
        #[arg(long, allow_hyphen_values = true)]
        x: f64,
        /// Target y (µm)
        #[arg(long, allow_hyphen_values = true)]
        y: f64,
        /// Session length in seconds
        #[arg(long, default_value = "10")]
        seconds: f64,
        /// Accumulate a correlation histogram once on target
        #[arg(long)]
        hbt: bool,
        /// Correlation bin width (ns)
        #[arg(long, default_value = "0.5")]
        hbt_resolution: f64,
        /// Correlation half-range (ns)
        #[arg(long, default_value = "100")]
        hbt_range: f64,
    },
}

/// Simulated instrument wired to a running task engine.
struct Instrument {
    orchestrator: Arc<ScanOrchestrator>,
    engine: TaskEngine,
    supervisor: tokio::task::JoinHandle<()>,
}

impl Instrument {
    async fn start(config: &DaqConfig) -> Result<Self> {
        let stage = Arc::new(SimulatedStage::with_settle(config.simulation.settle_time));
        let counter = Arc::new(SimulatedCounter::new(
            stage.clone(),
            config.simulation.model.clone(),
        ));
        let orchestrator = Arc::new(ScanOrchestrator::new(
            stage,
            counter.clone(),
            config.scan.clone(),
        ));
        let position = orchestrator.sync_position().await?;
        info!(position = %position, "Stage position adopted");

        let engine = TaskEngine::new(Arc::new(LoggingOwner), config.engine.clone())?;
        engine.register(
            RateSampler::NAME,
            RateSampler::new(counter, orchestrator.clone()),
            Schedule::Periodic(config.simulation.sample_interval),
        )?;
        let supervisor = engine.start();

        Ok(Self {
            orchestrator,
            engine,
            supervisor,
        })
    }

    async fn shutdown(self) -> Result<()> {
        self.orchestrator.stop().await?;
        self.engine.shutdown();
        self.supervisor.await.context("task engine supervisor panicked")?;
        for op in self.engine.list() {
            info!(
                operation = %op.name,
                status = %op.status,
                invocations = op.invocations,
                failures = op.consecutive_failures,
                "Operation summary"
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaqConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(name = %config.application.name, "Starting scan_daq");

    match cli.command {
        Command::Scan {
            rows,
            cols,
            step,
            x,
            y,
            json,
        } => run_scan(&config, GridShape::new(rows, cols), step, Vector2::new(x, y), json).await,
        Command::Track {
            x,
            y,
            seconds,
            hbt,
            hbt_resolution,
            hbt_range,
        } => {
            let hbt = hbt.then_some((hbt_resolution, hbt_range));
            run_track(&config, Vector2::new(x, y), seconds, hbt).await
        }
    }
}

async fn run_scan(
    config: &DaqConfig,
    shape: GridShape,
    step: f64,
    centre: Vector2,
    json: bool,
) -> Result<()> {
    let map = RasterMap::new(shape, Vector2::splat(step), centre)?;
    let instrument = Instrument::start(config).await?;
    let mut events = instrument.orchestrator.subscribe();
    instrument.orchestrator.scan(map).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ScanEvent::ModeChanged { to: Mode::Idle, .. }) => break,
                Ok(event) => debug!(event = event.kind(), "Scan event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event receiver lagged"),
                Err(RecvError::Closed) => bail!("orchestrator event channel closed"),
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; abandoning scan");
                break;
            }
        }
    }

    let finished = instrument.orchestrator.last_map().await;
    instrument.shutdown().await?;
    let Some(map) = finished else {
        bail!("scan did not complete");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        print_map(&map);
    }
    Ok(())
}

async fn run_track(
    config: &DaqConfig,
    target: Vector2,
    seconds: f64,
    hbt: Option<(f64, f64)>,
) -> Result<()> {
    let instrument = Instrument::start(config).await?;
    let mut events = instrument.orchestrator.subscribe();
    instrument.orchestrator.choose_point(target).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    let mut corrections: Vec<DriftEstimate> = Vec::new();
    let mut correlation: Option<CorrelationHistogram> = None;
    let mut hbt_pending = hbt;

    if instrument.orchestrator.mode().await == Mode::OnTarget {
        start_hbt(&instrument.orchestrator, &mut hbt_pending).await;
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; ending session");
                break;
            }
            event = events.recv() => match event {
                Ok(ScanEvent::CorrectionApplied(estimate)) => corrections.push(estimate),
                Ok(ScanEvent::CorrectionFailed { reason }) => warn!(%reason, "Correction failed"),
                Ok(ScanEvent::NewCorrelation(histogram)) => correlation = Some(histogram),
                Ok(ScanEvent::ModeChanged { to: Mode::OnTarget, .. }) => {
                    start_hbt(&instrument.orchestrator, &mut hbt_pending).await;
                }
                Ok(ScanEvent::ModeChanged { to: Mode::Idle, from }) => {
                    warn!(%from, "Orchestrator fell back to idle; ending session");
                    break;
                }
                Ok(event) => debug!(event = event.kind(), "Scan event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event receiver lagged"),
                Err(RecvError::Closed) => bail!("orchestrator event channel closed"),
            },
        }
    }

    let snapshot = instrument.orchestrator.snapshot().await;
    instrument.shutdown().await?;

    println!("Target            {target}");
    println!("Final position    {}", snapshot.position);
    println!("Position offset   {}", snapshot.position_offset);
    println!("Signal ratio      {:.3}", snapshot.signal_ratio);
    println!("Corrections       {}", corrections.len());
    for (i, c) in corrections.iter().enumerate() {
        println!(
            "  #{:<3} drift {}  background {:.1} kHz  peak {:.1} kHz",
            i + 1,
            c.drift,
            c.background,
            c.max
        );
    }
    if let Some(histogram) = correlation {
        match histogram.dip(true, true, snapshot.signal_ratio) {
            Some((tau, g2)) => println!(
                "g2 minimum        {g2:.3} at {tau:.2} ns ({} bins, {:?} integrated)",
                histogram.len(),
                histogram.integration_time
            ),
            None => println!("g2                empty histogram"),
        }
    }
    Ok(())
}

async fn start_hbt(orchestrator: &ScanOrchestrator, pending: &mut Option<(f64, f64)>) {
    if let Some((resolution, range)) = pending.take() {
        if let Err(err) = orchestrator.setup_hbt(resolution, range).await {
            warn!(error = %err, "Could not start correlation capture");
        }
    }
}

fn print_map(map: &RasterMap) {
    let shape = map.shape();
    let (lo, hi) = map.extents();
    println!("Map {shape} over {lo} .. {hi}");
    println!(
        "min {:.1} kHz  max {:.1} kHz  mean {:.1} kHz",
        map.min(),
        map.max(),
        map.mean()
    );
    for row in map.data().chunks(shape.cols) {
        let line: Vec<String> = row.iter().map(|v| format!("{v:7.1}")).collect();
        println!("{}", line.join(""));
    }
}

