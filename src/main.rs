//! stagepipe - Main Entry Point
//!
//! Runs the synthetic frame pipeline described by a config file and writes
//! the run report.
//!
//! ```text
//! stagepipe [config.toml|config.json]
//! ```

use anyhow::Context;
use stagepipe::{
    config::{default_config_path, AssemblyMode, PipelineConfig},
    pipeline::{Invoker, Monitor, PipelineEvent},
    workload,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_logging(&config);

    tracing::info!(
        "Starting stagepipe: mode={:?}, frames={}, capacity={}",
        config.mode,
        config.workload.frames,
        config.channel_capacity
    );

    let (pipeline, stats) =
        workload::build_pipeline(&config).context("Failed to assemble pipeline")?;
    tracing::info!("Topology: {}", pipeline.describe());

    let (monitor, events) = Monitor::new();
    let mut invoker = Invoker::with_monitor(monitor);

    let rate = match config.mode {
        AssemblyMode::Serial if config.rate.dynamic_rate => {
            tracing::warn!("Dynamic rate has no effect on a serial chain; using a fixed ceiling");
            let mut rate = config.rate.clone();
            rate.dynamic_rate = false;
            rate
        }
        _ => config.rate.clone(),
    };

    let report = pipeline
        .run_with(&mut invoker, rate)
        .context("Failed to start pipeline")?;

    for event in events.drain() {
        if let PipelineEvent::RateAdjusted { adjustment, .. } = event {
            tracing::debug!(
                "Rate {:?} -> {:?} at occupancy {}",
                adjustment.from,
                adjustment.to,
                adjustment.occupancy
            );
        }
    }

    for segment in &report.segments {
        tracing::info!(
            "{} '{}': in={} out={} elapsed={:?}{}",
            segment.id,
            segment.name,
            segment.items_in,
            segment.items_out,
            segment.elapsed,
            segment
                .error
                .as_deref()
                .map(|e| format!(" error: {}", e))
                .unwrap_or_default()
        );
    }

    let secs = report.wall_time.as_secs_f64();
    tracing::info!(
        "Encoded {} frames ({} bytes) in {:.2}s ({:.1} fps)",
        stats.frames(),
        stats.bytes(),
        secs,
        if secs > 0.0 { stats.frames() as f64 / secs } else { 0.0 }
    );

    if let Some(path) = &config.report_path {
        report
            .save(path)
            .with_context(|| format!("Failed to write run report to {:?}", path))?;
        tracing::info!("Run report written to {:?}", path);
    }

    if report.failed {
        anyhow::bail!(
            "pipeline failed: {}",
            report.first_error().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Config from the first argument, else the default location, else defaults
fn load_config() -> anyhow::Result<PipelineConfig> {
    if let Some(arg) = std::env::args_os().nth(1) {
        let path = PathBuf::from(arg);
        return PipelineConfig::load(&path)
            .with_context(|| format!("Failed to load config {:?}", path));
    }
    match default_config_path() {
        Some(path) if path.exists() => Ok(PipelineConfig::load_or_default(path)),
        _ => Ok(PipelineConfig::default()),
    }
}

fn init_logging(config: &PipelineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stagepipe=debug"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "stagepipe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}
