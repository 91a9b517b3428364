//! lobrec-recorder binary entry point

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lobrec_recorder::compaction::merge_range;
use lobrec_recorder::config::CompressionKind;
use lobrec_recorder::parquet_writer::ColumnarWriter;
use lobrec_recorder::{Config, Recorder};

#[derive(Parser, Debug)]
#[command(name = "lobrec-recorder")]
#[command(about = "Record L2 order book updates from a WebSocket feed to Parquet")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream from the feed until SIGTERM or ctrl-c
    Record {
        /// Path to recorder configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override storage.data_dir from the config file
        #[arg(long, env = "LOBREC_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Merge each day's per-flush files into one file per channel
    Merge {
        /// Data directory holding the date partitions
        #[arg(long, env = "LOBREC_DATA_DIR")]
        data_dir: PathBuf,

        /// First date to merge (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Last date to merge, inclusive (defaults to --start)
        #[arg(long)]
        end: Option<NaiveDate>,

        #[arg(long, value_enum, default_value_t = CompressionKind::Snappy)]
        compression: CompressionKind,

        /// List the files that would be merged without writing anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Record { config, data_dir } => record(config, data_dir).await,
        Command::Merge {
            data_dir,
            start,
            end,
            compression,
            dry_run,
        } => merge(data_dir, start, end.unwrap_or(start), compression, dry_run).await,
    }
}

async fn record(
    config_path: PathBuf,
    data_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(&config_path).map_err(|e| {
        error!(error = %e, "Failed to load config");
        e
    })?;
    if let Some(data_dir) = data_dir {
        config.storage.data_dir = data_dir;
        config.validate()?;
    }

    info!(
        url = %config.feed.url,
        instruments = ?config.feed.instruments,
        channels = ?config.feed.channels,
        data_dir = %config.storage.data_dir.display(),
        flush_interval_secs = config.flush.interval.as_secs(),
        max_buffer_size = config.flush.max_buffer_size,
        "Starting recorder"
    );

    let recorder = Recorder::from_config(&config)?;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    recorder.run(shutdown).await.map_err(|e| {
        error!(error = %e, "Recorder exited with error");
        e
    })?;
    Ok(())
}

async fn merge(
    data_dir: PathBuf,
    start: NaiveDate,
    end: NaiveDate,
    compression: CompressionKind,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        data_dir = %data_dir.display(),
        start = %start,
        end = %end,
        dry_run,
        "Starting daily merge"
    );

    let writer = ColumnarWriter::new(data_dir, compression);
    let stats =
        tokio::task::spawn_blocking(move || merge_range(&writer, start, end, dry_run)).await??;

    let files_merged: usize = stats.iter().map(|s| s.files_merged).sum();
    let rows: usize = stats.iter().map(|s| s.rows).sum();
    info!(
        channels_merged = stats.len(),
        files_merged,
        rows,
        "Merge complete"
    );
    Ok(())
}

/// Wait for SIGTERM or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to listen for SIGTERM, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down gracefully"),
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down gracefully"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("ctrl-c received, shutting down gracefully");
    }
}
