//! Event Processor Runtime
//!
//! This binary wires the query event pipeline together:
//! - Migrates and opens the SQLite store
//! - Warm-starts the schema registry from the latest persisted generation
//! - Connects the bus (NATS JetStream, or in-memory with BUS_BACKEND=memory)
//! - Provisions the primary / retry / dead-letter topics
//! - Spawns the demo producer (dev mode) and the ingestion pipeline
//! - On CTRL+C: cancels, drains the queue, logs a totals report
//!
//! Usage:
//!   cargo run --release --bin event_processor
//!
//! Environment variables: see `queryflow::config::AppConfig::from_env`.

use dotenv::dotenv;
use log::{error, info, warn};
use queryflow::bus::demo_producer::{run_demo_producer, DemoProducerConfig};
use queryflow::bus::{BusAdmin, BusConsumer, BusProducer, MemoryBus, NatsBus};
use queryflow::config::{AppConfig, BusBackend};
use queryflow::pipeline::{
    AggregationService, IngestionPipeline, QueryStore, RetryEscalator, SchemaRegistry,
    SqliteQueryStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Event Processor");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    config.log_summary();

    // Initialize database
    info!("🔧 Initializing database...");
    let store = Arc::new(SqliteQueryStore::open_migrated(
        &config.db_path,
        &config.schema_dir,
    )?);
    info!("✅ Database initialized");

    // Warm-start the registry
    let registry = match store.latest_schema_paths().await? {
        Some((generation, paths)) => {
            info!(
                "📐 Restored schema generation {} ({} paths)",
                generation,
                paths.len()
            );
            Arc::new(SchemaRegistry::with_snapshot(generation, paths))
        }
        None => {
            info!("📐 No persisted schema yet, waiting for a schema event");
            Arc::new(SchemaRegistry::new())
        }
    };

    // Connect the bus and provision topics
    let topics = config.topics.specs();
    let (producer, consumers): (Arc<dyn BusProducer>, Vec<Box<dyn BusConsumer>>) =
        match config.bus_backend {
            BusBackend::Nats => {
                let bus = NatsBus::connect(&config.nats_url, config.nats_connect_timeout()).await?;
                info!("🔧 Provisioning streams...");
                bus.ensure_topics(&topics).await?;

                // Parked retries are held unacked until not_before
                let ack_wait = config
                    .pipeline
                    .retry_interval()
                    .to_std()
                    .unwrap_or_default()
                    + Duration::from_secs(30);
                let consumers: Vec<Box<dyn BusConsumer>> = vec![
                    Box::new(bus.consumer(&config.topics.primary, ack_wait).await?),
                    Box::new(bus.consumer(&config.topics.retry, ack_wait).await?),
                ];
                let producer: Arc<dyn BusProducer> = Arc::new(bus);
                (producer, consumers)
            }
            BusBackend::Memory => {
                let bus = MemoryBus::new();
                info!("🔧 Provisioning topics...");
                bus.ensure_topics(&topics).await?;
                let consumers: Vec<Box<dyn BusConsumer>> = vec![
                    Box::new(bus.consumer(&config.topics.primary)),
                    Box::new(bus.consumer(&config.topics.retry)),
                ];
                let producer: Arc<dyn BusProducer> = Arc::new(bus);
                (producer, consumers)
            }
        };
    info!("✅ Topics ready");

    let shutdown = CancellationToken::new();

    let demo_handle = if config.demo_producer_enabled {
        let demo_config = DemoProducerConfig {
            topic: config.topics.primary.clone(),
            query_events: config.demo_query_events,
            interval: Duration::from_millis(500),
        };
        let producer = producer.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_demo_producer(producer, demo_config, shutdown).await {
                error!("❌ Demo producer failed: {}", e);
            }
        }))
    } else {
        None
    };

    let escalator = RetryEscalator::new(
        producer,
        config.topics.retry.clone(),
        config.topics.dead_letter.clone(),
        config.pipeline.max_retry_count,
        config.pipeline.retry_interval(),
    );
    let pipeline = IngestionPipeline::new(
        registry.clone(),
        store.clone(),
        escalator,
        config.pipeline.clone(),
    );

    let pipeline_handle = tokio::spawn(pipeline.run(consumers, shutdown.clone()));

    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    shutdown.cancel();

    if let Some(handle) = demo_handle {
        if let Err(e) = handle.await {
            warn!("⚠️  Demo producer task ended abnormally: {}", e);
        }
    }
    if let Err(e) = pipeline_handle.await {
        error!("❌ Pipeline task ended abnormally: {}", e);
    }

    // Totals report
    let service = AggregationService::new(registry, store);
    match service.get_total_counts().await {
        Ok(totals) => info!("📊 Query field totals: {}", totals),
        Err(e) => info!("📊 Query field totals: {}", e),
    }

    info!("✅ Event processor stopped");
    Ok(())
}
