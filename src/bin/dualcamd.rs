//! dualcamd - dual-source tracking daemon
//!
//! This daemon:
//! 1. Starts both configured frame sources through the `SourceRegistry`
//! 2. Runs one `TrackingOrchestrator` cycle per tick at the update rate
//! 3. Logs tracked objects (or emits them as JSON lines with `--json`)
//! 4. Periodically logs source health and reconnects failed sources

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dualcam_tracker::{
    CycleOutput, PipelineConfig, SourceConfig, SourceId, SourceRegistry, TrackingOrchestrator,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file (overrides DUALCAM_CONFIG).
    #[arg(long, env = "DUALCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Replace both sources with synthetic moving-object generators.
    #[arg(long)]
    synthetic: bool,
    /// Stop after this many cycles.
    #[arg(long)]
    cycles: Option<u64>,
    /// Override the update rate in Hz.
    #[arg(long)]
    rate: Option<u32>,
    /// Write every cycle to stdout as one JSON line.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::load()?,
    };
    if let Some(rate) = args.rate {
        if rate == 0 {
            return Err(anyhow!("rate must be >= 1"));
        }
        cfg.update_rate_hz = rate;
    }
    if args.synthetic {
        cfg.sources.source1 = SourceConfig::url("stub://left", "Synthetic Left");
        cfg.sources.source2 = SourceConfig::url("stub://right?shift=40", "Synthetic Right");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    let mut orchestrator = TrackingOrchestrator::from_config(&cfg)?;
    let mut registry = SourceRegistry::new();
    registry.initialize(&cfg.sources, &cfg.capture)?;

    log::info!(
        "dualcamd running. detector={} classes={:?} rate={}Hz baseline={}m",
        cfg.detector.backend,
        cfg.detector.classes,
        cfg.update_rate_hz,
        cfg.geometry.baseline_m
    );
    for id in SourceId::ALL {
        let source = cfg.sources.get(id);
        log::info!(
            "{}: {} ({}){}",
            id,
            source.display_name,
            source.origin(),
            if source.enabled { "" } else { " [disabled]" }
        );
    }

    let interval = cfg.cycle_interval();
    let mut last_health_log = Instant::now();
    let mut last_reconnect = Instant::now();
    let mut stdout = std::io::stdout().lock();

    while !shutdown.load(Ordering::SeqCst) {
        if args.cycles.is_some_and(|limit| orchestrator.cycles() >= limit) {
            break;
        }
        let tick = Instant::now();

        let frames = registry.get_frames();
        let output = orchestrator.process_cycle(frames.source1.as_ref(), frames.source2.as_ref());
        if args.json {
            serde_json::to_writer(&mut stdout, &output)?;
            writeln!(stdout)?;
        } else {
            log_cycle(&output);
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            for info in registry.get_source_info().values() {
                log::info!(
                    "{} health state={:?} fps={:.1} frames={} transport={} source={}",
                    info.id,
                    info.state,
                    info.fps,
                    info.frames_captured,
                    info.transport.as_deref().unwrap_or("-"),
                    info.source
                );
                if let Some(err) = &info.last_error {
                    log::warn!("{} last error: {}", info.id, err);
                }
            }
            last_health_log = Instant::now();
        }

        if last_reconnect.elapsed() >= RECONNECT_INTERVAL {
            for id in registry.failed_sources() {
                match registry.reconnect_source(id) {
                    Ok(()) => {
                        log::info!("{} reconnected", id);
                        orchestrator.reset_source(id);
                    }
                    Err(e) => log::warn!("{} reconnect failed: {}", id, e),
                }
            }
            last_reconnect = Instant::now();
        }

        if let Some(rest) = interval.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    log::info!(
        "shutting down after {} cycles, stopping sources...",
        orchestrator.cycles()
    );
    registry.stop_all();
    Ok(())
}

fn log_cycle(output: &CycleOutput) {
    for failure in &output.failures {
        log::warn!(
            "cycle {}: {} {:?} failed: {}",
            output.cycle,
            failure.source,
            failure.stage,
            failure.message
        );
    }
    for object in output.source1.iter().chain(&output.source2) {
        let Some(identity) = object.identity else {
            continue;
        };
        match object.position {
            Some(p) => log::debug!(
                "cycle {}: {} #{} {} conf={:.2} pos=({:.2}, {:.2}, {:.2})m",
                output.cycle,
                object.source,
                identity,
                object.class_name,
                object.confidence,
                p.x,
                p.y,
                p.z
            ),
            None => log::debug!(
                "cycle {}: {} #{} {} conf={:.2}",
                output.cycle,
                object.source,
                identity,
                object.class_name,
                object.confidence
            ),
        }
    }
}
