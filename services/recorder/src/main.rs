//! Framereel recorder service.
//!
//! # Architecture
//!
//! ```text
//! WebSocket devices -> Ingest -> Staging + Ledger -> Assembler -> Resampler -> ffmpeg
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with RECORDER_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use framereel_recorder::config::{LoggingConfig, RecorderConfig};
use framereel_recorder::stats::{log_stats, run_stats_monitor};
use framereel_recorder::{
    cleanup, ensure_dir, ingest, Assembler, AssemblerSettings, EncoderSettings, FfmpegEncoder,
    FrameLedger, IngestState, RecorderStats, StagingStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long to wait for open connections to finish after shutdown starts.
const INGEST_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    init_logging(&config.logging)?;

    info!(
        service = "framereel-recorder",
        version = env!("CARGO_PKG_VERSION"),
        "Starting recorder service"
    );

    config.validate().context("Invalid configuration")?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    // Startup preconditions: both directories usable, endpoint bound.
    let staging = Arc::new(
        StagingStore::open(
            &config.storage.staging_dir,
            &config.storage.frame_extension,
        )
        .context("Staging directory is not usable")?,
    );
    let output_dir =
        ensure_dir(&config.storage.output_dir).context("Output directory is not usable")?;
    info!(output_dir = %output_dir.display(), "Output directory ready");

    let stale = staging.leftovers().await;
    if !stale.is_empty() {
        warn!(files = stale.len(), "Removing staged files left by a previous run");
        cleanup::remove_files(stale).await;
    }

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind ingest listener on {}", address))?;

    let ledger = Arc::new(FrameLedger::new());
    let stats = Arc::new(RecorderStats::new());
    let shutdown = CancellationToken::new();

    let encoder = Arc::new(FfmpegEncoder::new(
        EncoderSettings::from(&config.encoder),
        staging.dir().to_path_buf(),
        output_dir,
    ));
    let assembler = Assembler::new(
        ledger.clone(),
        encoder,
        AssemblerSettings::from(&config.assembly),
        stats.clone(),
    );

    let ingest_state = IngestState {
        staging: staging.clone(),
        ledger: ledger.clone(),
        stats: stats.clone(),
        shutdown: shutdown.clone(),
        connections: TaskTracker::new(),
    };
    let connections = ingest_state.connections.clone();

    // Spawn ingest listener task
    let mut ingest_handle = tokio::spawn({
        let path = config.server.path.clone();
        async move { ingest::serve(listener, ingest_state, &path).await }
    });

    // Spawn assembler task
    let assembler_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { assembler.run(shutdown).await }
    });

    // Spawn stats monitor task
    let stats_handle = tokio::spawn({
        let stats = stats.clone();
        let ledger = ledger.clone();
        let shutdown = shutdown.clone();
        let interval = config.stats.interval();
        async move { run_stats_monitor(stats, move || ledger.len(), interval, shutdown).await }
    });

    info!("Recorder service started successfully");

    let mut ingest_finished = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
        result = &mut ingest_handle => {
            ingest_finished = true;
            match result {
                Ok(Ok(())) => warn!("Ingest listener exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Ingest listener failed"),
                Err(e) => error!(error = %e, "Ingest listener task panicked"),
            }
        }
    }

    shutdown.cancel();

    if !ingest_finished
        && tokio::time::timeout(INGEST_SHUTDOWN_GRACE, &mut ingest_handle)
            .await
            .is_err()
    {
        warn!("Ingest listener did not stop in time, aborting");
        ingest_handle.abort();
    }

    // Sockets finish their current frame write before the final sweep.
    connections.close();
    if tokio::time::timeout(INGEST_SHUTDOWN_GRACE, connections.wait())
        .await
        .is_err()
    {
        warn!(
            open = connections.len(),
            "Connections did not close in time"
        );
    }

    // Kills any in-flight encoder and cleans up frames still in the ledger.
    if let Err(e) = assembler_handle.await {
        error!(error = %e, "Assembler task panicked");
    }
    let _ = stats_handle.await;

    let stale = staging.leftovers().await;
    if !stale.is_empty() {
        cleanup::remove_files(stale).await;
    }

    log_stats(&stats.snapshot(), ledger.len(), "Final statistics");
    info!("Shutdown complete");

    Ok(())
}

/// Load configuration.
fn load_config() -> Result<RecorderConfig> {
    // Try loading from files first, fall back to environment
    let config = RecorderConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        RecorderConfig::from_env()
    })?;

    Ok(config)
}

/// Default filter used when RUST_LOG is not set.
fn default_filter(level: &str) -> String {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    format!("framereel_recorder={},tower_http=info,warn", level)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(&config.level)))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(
            default_filter("DEBUG"),
            "framereel_recorder=DEBUG,tower_http=info,warn"
        );
        assert_eq!(
            default_filter("nonsense"),
            "framereel_recorder=INFO,tower_http=info,warn"
        );
        assert!(EnvFilter::try_new(default_filter("trace")).is_ok());
    }
}
