//! QC Runtime - image-quality monitor
//!
//! This binary wires the quality pipeline together:
//! - Initializes SQLite database with schema
//! - Builds the image resolver, source extractor and pipeline
//! - Spawns the rolling aggregator on the control cadence
//! - Serves cached summaries and raw series over HTTP (QC_QUERY_ADDR)
//! - Feeds readout events (JSON lines on stdin) to the dispatcher
//!
//! Usage:
//!   camera-bridge | qc_runtime
//!
//! Environment variables: see `QcConfig::from_env` (QC_DB_PATH,
//! QC_SEX_PARAMS, QC_CONTROL_INTERVAL_MS, QC_WINDOW_MINUTES, ...)

use dotenv::dotenv;
use env_logger::Env;
use imgqc::camera::{
    extractor::{ExtractorParams, SExtractor},
    resolver::{HttpImageFetcher, ImageResolver},
    subscription::run_event_source,
};
use imgqc::pipeline::{
    aggregator::{aggregator_task, RollingAggregator},
    config::QcConfig,
    db::{run_schema_migrations, QualityStore, SqliteQualityStore},
    engine::StatsPipeline,
    ingestion::IngestionDispatcher,
    query,
    reduction::UsabilityMask,
};
use log::{error, info, warn};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🔭 QC Runtime - image quality monitor");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = QcConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Camera: {}", config.camera);
    info!("   ├─ Scheduler: {}", config.scheduler);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Image storage: {}", config.storage_dir);
    info!("   ├─ Extractor: {}", config.extractor_bin);
    info!(
        "   ├─ Extractor params: {}",
        config.sex_params.as_deref().unwrap_or("(defaults)")
    );
    info!("   ├─ Max catalog: {}", config.max_catalog);
    info!("   ├─ Min CLASS_STAR: {}", config.min_class_star);
    info!("   ├─ Control interval: {}ms", config.control_interval_ms);
    info!("   ├─ Window: {} min", config.window_minutes);
    info!(
        "   ├─ Query endpoint: {}",
        config.query_addr.as_deref().unwrap_or("(disabled)")
    );
    if config.filters.is_empty() {
        info!("   └─ Filters: discovered from storage");
    } else {
        info!("   └─ Filters: {}", config.filters.join(", "));
    }

    // Initialize database
    info!("🔧 Initializing database...");
    let mut conn = Connection::open(&config.db_path)?;

    // Run schema migrations (idempotent)
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn); // Close temporary connection

    let store: Arc<dyn QualityStore> = Arc::new(SqliteQualityStore::new(&config.db_path)?);
    info!("✅ Database initialized");

    // Extraction collaborators
    let params = Arc::new(ExtractorParams::load(config.sex_params.as_deref())?);
    let fetcher = HttpImageFetcher::new(config.fetch_timeout())?;
    let resolver = ImageResolver::new(&config.storage_dir, Box::new(fetcher));

    let pipeline = StatsPipeline::new(
        resolver,
        Arc::new(SExtractor::new(&config.extractor_bin)),
        params,
        store.clone(),
    )
    .with_max_catalog(config.max_catalog)
    .with_mask(UsabilityMask::new(config.min_class_star))
    .with_keep_fetched(config.keep_fetched);
    info!("✅ StatsPipeline created");

    let dispatcher = Arc::new(IngestionDispatcher::new(
        Arc::new(pipeline),
        tokio::runtime::Handle::current(),
    ));

    // Spawn background tasks
    info!("🚀 Spawning background tasks...");

    let aggregator = Arc::new(RollingAggregator::new(
        store.clone(),
        config.filters.clone(),
        config.window(),
    ));
    let aggregator_handle = tokio::spawn(aggregator_task(
        aggregator.clone(),
        config.control_interval(),
        config.summary_path.clone(),
    ));
    info!("   ├─ ✅ Aggregator task spawned");

    let query_handle = match config.query_addr.as_deref() {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let aggregator_queries = aggregator.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = query::serve(listener, aggregator_queries).await {
                    error!("❌ Query endpoint failed: {}", e);
                }
            });
            info!("   ├─ ✅ Query endpoint on {}", addr);
            Some(handle)
        }
        None => None,
    };

    let dispatcher_events = dispatcher.clone();
    let events_handle = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match run_event_source(stdin, dispatcher_events.as_ref()).await {
            Ok(stats) => info!(
                "📭 Readout stream ended ({} delivered, {} malformed)",
                stats.delivered, stats.malformed
            ),
            Err(e) => error!("❌ Readout stream failed: {}", e),
        }
    });
    info!("   └─ ✅ Readout subscription on stdin");

    info!("");
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

    events_handle.abort();
    aggregator_handle.abort();
    if let Some(handle) = query_handle {
        handle.abort();
    }

    let (dispatched, ignored) = dispatcher.counts();
    if dispatched == 0 {
        warn!("No exposures were processed this session");
    }
    info!("📊 Session: {} dispatched, {} ignored", dispatched, ignored);

    // Give in-flight runs time to finish
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    info!("✅ QC runtime stopped");
    Ok(())
}
