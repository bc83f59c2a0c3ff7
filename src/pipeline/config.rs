//! Runtime configuration from environment variables

use super::reduction::DEFAULT_MIN_CLASS_STAR;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the quality-control runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct QcConfig {
    /// Camera endpoint reference (proxy path in the control framework)
    pub camera: String,

    /// Scheduler endpoint reference
    pub scheduler: String,

    /// Optional JSON file with extractor options
    pub sex_params: Option<String>,

    /// External source-detection program
    pub extractor_bin: String,

    /// Maximum catalog entries stored per image
    pub max_catalog: usize,

    /// Control-loop cadence in milliseconds
    pub control_interval_ms: u64,

    /// Rolling aggregation window in minutes
    pub window_minutes: i64,

    /// Usability mask threshold on the star/galaxy classifier
    pub min_class_star: f64,

    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the schema .sql files
    pub schema_dir: String,

    /// Default storage directory for fetched images
    pub storage_dir: String,

    /// Known filter identifiers (empty → discovered from storage)
    pub filters: Vec<String>,

    /// HTTP timeout for remote image fetches
    pub fetch_timeout_secs: u64,

    /// Keep downloaded images after extraction
    pub keep_fetched: bool,

    /// Optional JSON file rewritten with the cached summaries every cycle
    pub summary_path: Option<String>,

    /// Bind address of the HTTP query endpoint (empty → disabled)
    pub query_addr: Option<String>,
}

impl QcConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `QC_CAMERA` (default: /Camera/0)
    /// - `QC_SCHEDULER` (default: /Scheduler/0)
    /// - `QC_SEX_PARAMS` (default: unset)
    /// - `QC_EXTRACTOR_BIN` (default: source-extractor)
    /// - `QC_MAX_CATALOG` (default: 100)
    /// - `QC_CONTROL_INTERVAL_MS` (default: 10000)
    /// - `QC_WINDOW_MINUTES` (default: 30)
    /// - `QC_MIN_CLASS_STAR` (default: 0.8)
    /// - `QC_DB_PATH` (default: /var/lib/imgqc/image_statistics.db)
    /// - `QC_SCHEMA_DIR` (default: sql)
    /// - `QC_STORAGE_DIR` (default: /var/lib/imgqc/images)
    /// - `QC_FILTERS` (comma-separated, default: empty)
    /// - `QC_FETCH_TIMEOUT_SECS` (default: 60)
    /// - `QC_KEEP_FETCHED` (default: false)
    /// - `QC_SUMMARY_PATH` (default: unset)
    /// - `QC_QUERY_ADDR` (default: 127.0.0.1:8765, empty disables)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, test map, ...)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        Self {
            camera: lookup("QC_CAMERA").unwrap_or_else(|| "/Camera/0".to_string()),

            scheduler: lookup("QC_SCHEDULER").unwrap_or_else(|| "/Scheduler/0".to_string()),

            sex_params: non_empty("QC_SEX_PARAMS"),

            extractor_bin: lookup("QC_EXTRACTOR_BIN")
                .unwrap_or_else(|| "source-extractor".to_string()),

            max_catalog: parse_var(lookup("QC_MAX_CATALOG")).unwrap_or(100),

            control_interval_ms: parse_var(lookup("QC_CONTROL_INTERVAL_MS"))
                .filter(|ms: &u64| *ms > 0)
                .unwrap_or(10_000),

            window_minutes: parse_var(lookup("QC_WINDOW_MINUTES"))
                .filter(|m: &i64| *m > 0 && chrono::Duration::try_minutes(*m).is_some())
                .unwrap_or(30),

            min_class_star: parse_var(lookup("QC_MIN_CLASS_STAR")).unwrap_or(DEFAULT_MIN_CLASS_STAR),

            db_path: lookup("QC_DB_PATH")
                .unwrap_or_else(|| "/var/lib/imgqc/image_statistics.db".to_string()),

            schema_dir: lookup("QC_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),

            storage_dir: lookup("QC_STORAGE_DIR")
                .unwrap_or_else(|| "/var/lib/imgqc/images".to_string()),

            filters: lookup("QC_FILTERS")
                .map(|s| {
                    s.split(',')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            fetch_timeout_secs: parse_var(lookup("QC_FETCH_TIMEOUT_SECS")).unwrap_or(60),

            keep_fetched: lookup("QC_KEEP_FETCHED")
                .and_then(|s| s.trim().to_lowercase().parse().ok())
                .unwrap_or(false),

            summary_path: non_empty("QC_SUMMARY_PATH"),

            query_addr: match lookup("QC_QUERY_ADDR") {
                Some(addr) if addr.trim().is_empty() => None,
                Some(addr) => Some(addr.trim().to_string()),
                None => Some("127.0.0.1:8765".to_string()),
            },
        }
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.window_minutes)
            .unwrap_or_else(|| chrono::Duration::minutes(30))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Reject values that parse but cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.trim().is_empty() {
            return Err(ConfigError::MissingVariable("QC_DB_PATH".to_string()));
        }

        if !(0.0..1.0).contains(&self.min_class_star) {
            return Err(ConfigError::InvalidValue(format!(
                "QC_MIN_CLASS_STAR must be in [0, 1), got {}",
                self.min_class_star
            )));
        }

        if self.extractor_bin.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "QC_EXTRACTOR_BIN cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse a trimmed variable; unparseable values count as unset
fn parse_var<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|s| s.trim().parse().ok())
}
