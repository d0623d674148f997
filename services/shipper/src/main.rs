// shipper: Drains telemetry records from a queue and ships them, batched
// and optionally dictionary-compressed, to a consumer over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use shipper::config::{self, ShipperConfig};
use shipper::meter::Meter;
use shipper::pool::{PoolConfig, StreamPool};
use shipper::processor::Processor;
use shipper::publisher::Publisher;
use shipper::reader::QueueReader;
use shipper::stats::StatsReporter;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// How long shutdown waits for the publishers' final flush.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        readers = config.readers,
        writers = config.writers,
        "shipper starting"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.num_cpus > 0 {
        builder.worker_threads(config.num_cpus);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("FATAL: unable to build runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
}

async fn run(config: ShipperConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (incoming_tx, incoming_rx) = mpsc::channel(config.max_buffer_size);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(config.max_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let incoming_meter = Arc::new(Meter::new());
    let outgoing_records = Arc::new(Meter::new());
    let outgoing_bytes = Arc::new(Meter::new());
    let outgoing_errors = Arc::new(Meter::new());

    // Consumer side first: the pool warms in the background and the
    // publishers block on it until a connection is ready.
    info!(url = %config.consumer_url, connections = config.writers, "initiating consumer pool");
    let pool = StreamPool::new(
        config.writers,
        PoolConfig {
            url: config.consumer_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            retry_timeout: Duration::from_secs(config.retry_connection_timeout_seconds),
            max_age: Duration::from_secs(config.max_connection_age_seconds),
        },
    );

    let publisher = Publisher::new(
        &config,
        outgoing_rx,
        Arc::clone(&pool),
        Arc::clone(&outgoing_records),
        Arc::clone(&outgoing_bytes),
        Arc::clone(&outgoing_errors),
    );
    let publisher_handles = publisher.start(config.writers);

    let processor_handle = tokio::spawn(Processor::new(incoming_rx, outgoing_tx).run());

    let stats_handle = tokio::spawn(
        StatsReporter::new(
            &config,
            incoming_tx.clone(),
            Arc::clone(&incoming_meter),
            Arc::clone(&outgoing_records),
            Arc::clone(&outgoing_bytes),
            shutdown_rx.clone(),
        )
        .run(),
    );

    // Gate the drainers on consumer reachability: until the consumer is
    // dialable there is no point claiming records off the queue.
    pool.wait_for_connection().await;

    info!("subscribing to the metrics queue");
    let reader = QueueReader::new(
        &config,
        incoming_tx.clone(),
        Arc::clone(&incoming_meter),
        shutdown_rx,
    )?;
    let reader_handles = reader.subscribe();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Ordered teardown: stop claiming, drain the pipe, flush, exit.
    let _ = shutdown_tx.send(true);
    for handle in reader_handles {
        let _ = handle.await;
    }
    let _ = stats_handle.await;
    // All senders gone: the processor drains incoming and closes outgoing.
    drop(incoming_tx);
    let _ = processor_handle.await;
    // Publishers flush whatever is left; don't wait forever on a consumer
    // that stopped answering.
    for handle in publisher_handles {
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, handle)
            .await
            .is_err()
        {
            warn!("publisher did not flush within the shutdown timeout");
            break;
        }
    }

    info!(
        incoming = incoming_meter.count(),
        outgoing = outgoing_records.count(),
        errors = outgoing_errors.count(),
        "shipper stopped"
    );
    Ok(())
}
