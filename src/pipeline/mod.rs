//! # Image-quality pipeline
//!
//! Turns camera readouts into persisted per-image quality metrics and keeps
//! rolling per-filter summaries for operators and schedulers.
//!
//! ## Flow
//!
//! ```text
//! readout ─► IngestionDispatcher (eligibility)
//!               └─► task: resolve image ─► extract sources ─► reduce ─► save
//!
//! tick ─► RollingAggregator ─► query window per filter ─► cached summaries
//!                 ▲
//! GET /summaries, /image_statistics ─┘
//! ```
//!
//! Each exposure runs on its own detached task. A failed run is logged and
//! affects nothing else. The SQLite store is the only shared mutable state;
//! every write is a single transaction covering the image record and its
//! catalog rows.
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (SourceRecord, ImageQualityRecord, summaries)
//! - `reduction` - Usability mask, metrics, brightness-ranked catalog
//! - `db` - QualityStore trait, SQLite implementation, schema migrations
//! - `engine` - Per-exposure pipeline run
//! - `ingestion` - Event eligibility and task dispatch
//! - `aggregator` - Rolling window summaries and raw series queries
//! - `query` - HTTP endpoint serving cached summaries and raw series
//! - `config` - Environment configuration

pub mod aggregator;
pub mod config;
pub mod db;
pub mod engine;
pub mod ingestion;
pub mod query;
pub mod reduction;
pub mod types;

// Re-export commonly used types
pub use aggregator::{aggregator_task, AggregatorState, RollingAggregator};
pub use config::{ConfigError, QcConfig};
pub use db::{run_schema_migrations, PersistenceError, QualityStore, SqliteQualityStore};
pub use engine::{PipelineError, RunOutcome, StatsPipeline};
pub use ingestion::{is_eligible, IngestionDispatcher};
pub use reduction::{reduce, InsufficientDataError, UsabilityMask};
pub use types::{
    FilterSeries, ImageQualityRecord, QualityMetrics, RollingFilterSummary, SourceCatalogEntry,
    SourceRecord,
};
