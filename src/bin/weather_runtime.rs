//! Weather Runtime - feed to hourly bars
//!
//! This binary wires the whole pipeline together:
//! - Initializes the SQLite database with schema
//! - Builds the ingestion buffer on top of the store
//! - Connects the WebSocket feed client (reconnects on its own)
//! - Starts the periodic aggregation scheduler
//!
//! Usage:
//!   cargo run --release --bin weather_runtime
//!
//! Environment variables:
//!   WEATHER_FEED_URL - Feed endpoint (default: ws://localhost:8765)
//!   WEATHERFLOW_DB_PATH - SQLite database path (default: data/weather.db)
//!   INGESTION_FLUSH_THRESHOLD - Readings per city per batch (default: 50)
//!   SCHEDULER_INTERVAL_MINUTES - Aggregation interval (default: 15)

use dotenv::dotenv;
use log::{error, info, warn};
use rusqlite::Connection;
use std::sync::Arc;
use weatherflow::pipeline::{
    aggregation::AggregationService,
    config::PipelineConfig,
    db::{run_schema_migrations, ReadingStore, SqliteReadingStore},
    ingestion::IngestionBuffer,
    scheduler::AggregationScheduler,
};
use weatherflow::streamer_core::{RuntimeConfig, WeatherFeedClient};

// Single-threaded: the buffer relies on every record() of a tick landing
// before the deferred flush runs
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();

    let runtime_config = RuntimeConfig::from_env()?;
    env_logger::Builder::new()
        .parse_filters(&runtime_config.rust_log)
        .target(env_logger::Target::Stderr)
        .init();

    // rustls 0.23 needs a process-level crypto provider before any wss:// dial
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("⚠️  A rustls crypto provider was already installed");
    }

    let config = PipelineConfig::from_env();

    info!("🚀 Weather Runtime");
    info!("   ├─ Feed: {}", runtime_config.feed_url);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Flush threshold: {} readings/city", config.flush_threshold);
    info!(
        "   ├─ Reconnect delay: {}s",
        runtime_config.reconnect_delay_secs
    );
    info!(
        "   └─ Aggregation: every {} min over {}h for {}",
        config.scheduler.interval_minutes,
        config.scheduler.window_hours,
        config.scheduler.cities.join(", ")
    );

    // Initialize database
    info!("🔧 Initializing database...");
    let store = SqliteReadingStore::new(&config.db_path)?;
    {
        let mut conn = Connection::open(&config.db_path)?;
        run_schema_migrations(&mut conn, &config.schema_dir)?;
    }
    let store: Arc<dyn ReadingStore> = Arc::new(store);
    info!("✅ Database initialized");

    let buffer = IngestionBuffer::new(store.clone(), config.flush_threshold);
    let service = Arc::new(AggregationService::new(store.clone()));
    let scheduler = AggregationScheduler::new(service, config.scheduler.clone());
    let client = WeatherFeedClient::new(&runtime_config, buffer);

    // A refused first dial is not fatal, the client keeps retrying
    if let Err(e) = client.connect().await {
        warn!("⚠️  Feed unavailable at startup ({}), retrying in background", e);
    }

    scheduler.start();

    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    if scheduler.is_running() {
        scheduler.stop();
    }
    client.disconnect().await;

    info!("✅ Weather runtime stopped");
    Ok(())
}
