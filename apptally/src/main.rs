//! apptally command line
//!
//! Drives the request counters against the in-memory stores: record a burst of
//! requests from concurrent workers, flush, and report the aggregates.

use anyhow::{Context, Result};
use apptally::config::LoggingConfig;
use apptally::{
    AggregateStore, AppTallyConfig, Consolidator, KVStore, MemoryAggregateStore, RecordOptions,
    RequestType, SystemClock, metrics,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "apptally")]
#[command(about = "Buffered per-day request counters with durable consolidation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record requests from concurrent workers, flush, and print the aggregates
    Simulate {
        /// Number of requests to record
        #[arg(short, long, default_value_t = 150)]
        events: usize,

        /// Request type to record (anon, logged_in, crawler)
        #[arg(short = 't', long, default_value = "anon")]
        request_type: RequestType,

        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 8)]
        workers: usize,

        /// Override the auto-flush threshold for every recorded request
        #[arg(long)]
        autoflush: Option<i64>,

        /// Aggregate snapshot to load before and save after the run
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Print Prometheus metrics after the run
        #[arg(long = "metrics")]
        print_metrics: bool,
    },

    /// Print the effective configuration as YAML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppTallyConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => AppTallyConfig::default(),
    };

    init_tracing(&config.logging, cli.verbose);
    info!("Starting apptally v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Simulate {
            events,
            request_type,
            workers,
            autoflush,
            snapshot,
            print_metrics,
        } => {
            simulate(
                &config,
                events,
                request_type,
                workers.max(1),
                RecordOptions { autoflush },
                snapshot,
            )
            .await?;

            if print_metrics {
                let text = metrics::encode_metrics()
                    .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
                println!("{}", text);
            }
        }

        Commands::ShowConfig => {
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

async fn simulate(
    config: &AppTallyConfig,
    events: usize,
    request_type: RequestType,
    workers: usize,
    options: RecordOptions,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let kv = KVStore::new(config.to_kv_config());
    let ttl_cleanup = kv.start_ttl_cleanup();

    let store = match &snapshot {
        Some(path) if path.exists() => MemoryAggregateStore::load_snapshot(path)
            .await
            .with_context(|| format!("Failed to load snapshot {:?}", path))?,
        _ => MemoryAggregateStore::new(),
    };

    let consolidator = Arc::new(Consolidator::new(
        Arc::new(kv.clone()),
        Arc::new(store.clone()),
        Arc::new(SystemClock),
        config.consolidator.clone(),
    ));
    let scheduler = consolidator.start_flush_scheduler(config.flush_interval());

    info!(
        "Recording {} {} requests with {} workers",
        events, request_type, workers
    );

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let share = events / workers + usize::from(worker < events % workers);
        let consolidator = Arc::clone(&consolidator);
        handles.push(tokio::spawn(async move {
            for _ in 0..share {
                consolidator.record_event(request_type, options).await?;
            }
            Ok::<_, apptally::TallyError>(())
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await.context("Worker panicked")? {
            warn!("Worker stopped early: {}", e);
        }
    }

    let summary = match consolidator.flush_all(None).await {
        Ok(summary) => summary,
        Err(e) if e.is_store_fault() => {
            return Err(e).context("Final flush failed, aggregate store unavailable");
        }
        Err(e) => return Err(e).context("Final flush failed"),
    };
    info!(
        "Final flush committed {} counts ({} races lost)",
        summary.committed_units(),
        summary.races_lost()
    );

    if let Some(handle) = scheduler {
        handle.abort();
    }
    ttl_cleanup.abort();

    println!("{:<12} {:<10} {:>10}", "date", "type", "count");
    for record in store.list().await? {
        println!(
            "{:<12} {:<10} {:>10}",
            record.date.to_string(),
            record.request_type,
            record.count
        );
    }

    let mut pending = Vec::new();
    for key in kv.scan(&config.consolidator.key_prefix).await {
        if kv.get(&key).await?.unwrap_or(0) != 0 {
            pending.push(key);
        }
    }
    if !pending.is_empty() {
        warn!("{} counter key(s) still pending: {:?}", pending.len(), pending);
    }

    if let Some(path) = snapshot {
        store
            .save_snapshot(&path)
            .await
            .with_context(|| format!("Failed to save snapshot {:?}", path))?;
    }

    Ok(())
}
