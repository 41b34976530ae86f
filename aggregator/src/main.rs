//! Trellis aggregator service
//!
//! Opens storage, then runs the periodic flush/rollup task, the retention
//! reaper and the admin HTTP server until interrupted.
//!
//! The binary has no network ingestion endpoint. Aggregates, gauge values and
//! traces enter through the library's [`Collector`] API by an embedding
//! process; standalone, the service only flushes, rolls up, reaps and serves
//! health and metrics over storage that already exists.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trellis_aggregator::{
    collector::Collector,
    config::AggregatorConfig,
    live::LiveBuffer,
    merge::MergeLimits,
    reaper::Reaper,
    scheduler::{join_tasks, spawn_fixed_delay},
    server,
    storage::Storage,
};
use trellis_shared::utils::time::system_time_millis;

#[derive(Parser, Debug)]
#[command(name = "trellis-aggregator")]
#[command(about = "Rollup aggregation and capped storage service", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    /// Override the storage data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = AggregatorConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    info!(data_dir = %config.storage.data_dir.display(), "Starting Trellis aggregator");

    let storage_config = config.storage.clone();
    let storage = tokio::task::spawn_blocking(move || Storage::open(&storage_config))
        .await
        .context("Storage open task failed")?
        .context("Failed to open storage")?;
    let storage = Arc::new(storage);

    let limits = MergeLimits::new(
        config.storage.max_queries_per_type,
        config.storage.max_service_calls_per_type,
    );
    let live = Arc::new(LiveBuffer::new(config.max_live_intervals, limits));
    let collector = Arc::new(Collector::new(
        storage.aggregates.clone(),
        storage.gauge_values.clone(),
        storage.traces.clone(),
        live,
        config.rollup_grace_millis as i64,
    ));
    let reaper = Reaper::new(storage.clone(), &config.storage);

    let cancel = CancellationToken::new();
    let flush_collector = collector.clone();
    let flush_task = spawn_fixed_delay(
        "flush",
        Duration::from_millis(config.flush_interval_millis),
        cancel.clone(),
        Arc::new(move || {
            if let Err(e) = flush_collector.flush(system_time_millis()) {
                error!(error = %e, "Flush failed");
            }
        }),
    );
    let reaper_task = spawn_fixed_delay(
        "reaper",
        Duration::from_millis(config.reaper_interval_millis),
        cancel.clone(),
        Arc::new(move || {
            reaper.run_once(system_time_millis());
        }),
    );

    let admin_addr: SocketAddr = config
        .admin_addr
        .parse()
        .context("Invalid admin address")?;
    let admin_cancel = cancel.clone();
    let admin_storage = storage.clone();
    let admin_task = tokio::spawn(async move {
        let shutdown = async move { admin_cancel.cancelled().await };
        if let Err(e) = server::serve_admin(admin_addr, admin_storage, shutdown).await {
            error!(error = %e, "Admin HTTP server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();
    join_tasks(vec![
        ("flush", flush_task),
        ("reaper", reaper_task),
        ("admin", admin_task),
    ])
    .await;

    let final_collector = collector.clone();
    let final_storage = storage.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = final_collector.flush(system_time_millis()) {
            error!(error = %e, "Final flush failed");
        }
        final_storage.close();
    })
    .await
    .context("Final flush task failed")?;

    info!("Trellis aggregator stopped");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
