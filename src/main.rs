//! POS transaction aggregator
//!
//! Consumes POS transactions from an MQTT topic, sums `total_amount` per
//! store over event-time tumbling windows and posts one aggregate per
//! closed window to the validation service.
//!
//! Module structure:
//! - `domain/` - Core types (TransactionEvent, Window, Accumulator, AggregatedEvent)
//! - `io/` - External interfaces (MQTT ingestion, ingestion queue, HTTP sink)
//! - `services/` - Aggregation logic (normalizer, windows, watermarks, pipeline)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use pos_aggregator::infra::{Config, Metrics};
use pos_aggregator::io::{AggregateSink, HttpSink, IngestQueue, MqttIngest};
use pos_aggregator::services::spawn_pipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Event-time windowed POS transaction aggregator
#[derive(Parser, Debug)]
#[command(name = "pos-aggregator", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "pos_aggregator_starting");

    let config = match args.config {
        Some(ref path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    info!(
        config_file = %config.config_file(),
        broker_host = %config.broker_host(),
        broker_port = %config.broker_port(),
        broker_topic = %config.broker_topic(),
        sink_url = %config.sink_url(),
        window_length_ms = %config.window_length_ms(),
        align_to = %config.align_to(),
        allowed_lateness_ms = %config.allowed_lateness_ms(),
        queue_capacity = %config.queue_capacity(),
        workers = %config.workers(),
        reducer_shards = %config.reducer_shards(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let queue = Arc::new(IngestQueue::new(config.queue_capacity()));
    let sink: Arc<dyn AggregateSink> =
        Arc::new(HttpSink::new(&config).context("failed to build HTTP sink client")?);

    let pipeline = spawn_pipeline(&config, queue.clone(), sink, metrics.clone())?;

    // Periodic metrics summary (lock-free reads)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown_signal_received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "ctrl_c_handler_unavailable");
                // Keep the sender alive so shutdown is never signalled spuriously
                std::future::pending::<()>().await;
            }
        }
    });

    // Ingestion runs on the main task; it closes the queue when it returns
    let ingest_result = MqttIngest::new(&config, queue, metrics.clone()).run(shutdown_rx).await;
    if let Err(ref e) = ingest_result {
        error!(error = %e, "mqtt_ingest_failed");
    }

    pipeline.join().await;
    reporter.abort();
    metrics.report().log();

    ingest_result.context("broker ingestion failed")?;
    info!("pos_aggregator_shutdown_complete");
    Ok(())
}
