//! Persistence gateway for image-quality records and their source catalogs
//!
//! Tables (see `sql/` directory):
//! - `image_statistics` - one row per processed exposure (insert-only)
//! - `image_catalog` - ranked sources, FK → image_statistics(id)
//!
//! The gateway is constructed once at startup and shared as
//! `Arc<dyn QualityStore>`; every component reaches storage through it.

use super::types::{ImageQualityRecord, NewImageQuality, SourceCatalogEntry, SourceRecord};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum PersistenceError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    Schema(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Database(err)
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err)
    }
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Database(e) => write!(f, "Database error: {}", e),
            PersistenceError::Io(e) => write!(f, "IO error: {}", e),
            PersistenceError::Schema(msg) => write!(f, "Schema error: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Transactional, queryable store for quality records
#[async_trait]
pub trait QualityStore: Send + Sync {
    /// Insert one image record and its catalog rows as a single transaction
    ///
    /// Returns the identity assigned to the image record. On error nothing
    /// from this call is visible to later reads.
    async fn save(
        &self,
        record: NewImageQuality,
        catalog: Vec<SourceRecord>,
    ) -> Result<i64, PersistenceError>;

    /// Records for `filter` with date_obs in [now - window, now)
    async fn query_by_filter_since(
        &self,
        filter: &str,
        window: Duration,
    ) -> Result<Vec<ImageQualityRecord>, PersistenceError>;

    /// Every filter that has at least one stored record
    async fn distinct_filters(&self) -> Result<Vec<String>, PersistenceError>;

    /// Catalog rows owned by one image record, brightest first
    async fn catalog_for(&self, image_id: i64) -> Result<Vec<SourceCatalogEntry>, PersistenceError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in name order (00_, 01_, ...) and
/// executes them. Every file must use IF NOT EXISTS so reruns are no-ops.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), PersistenceError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(PersistenceError::Schema(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    apply_optimized_pragmas(conn)?;

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ Schema migrations completed");

    Ok(())
}

/// SQLite implementation of QualityStore
///
/// One connection behind a mutex: concurrent workers serialize on it, and
/// each `save` is a single SQLite transaction.
pub struct SqliteQualityStore {
    conn: Arc<Mutex<Connection>>,

    /// Current time in epoch milliseconds (replaceable for tests)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl SqliteQualityStore {
    /// Open the store at `db_path`
    ///
    /// Does NOT create the schema; run `run_schema_migrations` first.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        Self::new_with_clock(db_path, Box::new(|| Utc::now().timestamp_millis()))
    }

    /// Open the store with a custom clock (epoch milliseconds)
    pub fn new_with_clock(
        db_path: impl AsRef<Path>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            now_fn,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Schema("connection mutex poisoned".to_string()))
    }

    /// Records for `filter` with date_obs in [start, end), ordered by time
    pub fn query_between(
        &self,
        filter: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ImageQualityRecord>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, filename, filter, exptime, date_obs, fwhm_avg, fwhm_std, background, npts
             FROM image_statistics
             WHERE filter = ?1 AND date_obs >= ?2 AND date_obs < ?3
             ORDER BY date_obs ASC, id ASC",
        )?;

        let rows = stmt.query_map(
            params![filter, start.timestamp_millis(), end.timestamp_millis()],
            row_to_record,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<ImageQualityRecord> {
    let date_obs_ms: i64 = row.get(4)?;
    let date_obs = DateTime::<Utc>::from_timestamp_millis(date_obs_ms).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(4, date_obs_ms)
    })?;

    Ok(ImageQualityRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        filter: row.get(2)?,
        exptime: row.get(3)?,
        date_obs,
        fwhm_avg: row.get(5)?,
        fwhm_std: row.get(6)?,
        background: row.get(7)?,
        npts: row.get(8)?,
    })
}

fn row_to_catalog_entry(row: &Row) -> rusqlite::Result<SourceCatalogEntry> {
    Ok(SourceCatalogEntry {
        id: row.get(0)?,
        image_statistics_id: row.get(1)?,
        source: SourceRecord {
            number: row.get(2)?,
            x_image: nullable(row.get(3)?),
            y_image: nullable(row.get(4)?),
            xwin_image: nullable(row.get(5)?),
            ywin_image: nullable(row.get(6)?),
            alpha_j2000: row.get(7)?,
            delta_j2000: row.get(8)?,
            mag_auto: nullable(row.get(9)?),
            flux_auto: nullable(row.get(10)?),
            background: nullable(row.get(11)?),
            fwhm_image: nullable(row.get(12)?),
            flags: row.get(13)?,
            class_star: nullable(row.get(14)?),
        },
    })
}

/// SQLite stores NaN/inf as NULL; map them back to NaN
fn nullable(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NAN)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

#[async_trait]
impl QualityStore for SqliteQualityStore {
    async fn save(
        &self,
        record: NewImageQuality,
        catalog: Vec<SourceRecord>,
    ) -> Result<i64, PersistenceError> {
        let mut conn = self.lock()?;

        // Dropping `tx` without commit rolls back both tables
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO image_statistics
                (filename, filter, exptime, date_obs, fwhm_avg, fwhm_std, background, npts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.exposure.filename,
                record.exposure.filter,
                record.exposure.exptime,
                record.exposure.date_obs.timestamp_millis(),
                record.metrics.fwhm_avg,
                record.metrics.fwhm_std,
                record.metrics.background_avg,
                record.metrics.npts,
            ],
        )?;

        let image_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO image_catalog
                    (image_statistics_id, number, x_image, y_image, xwin_image, ywin_image,
                     alpha_j2000, delta_j2000, mag_auto, flux_auto, background, fwhm_image,
                     flags, class_star)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;

            for source in &catalog {
                stmt.execute(params![
                    image_id,
                    source.number,
                    finite(source.x_image),
                    finite(source.y_image),
                    finite(source.xwin_image),
                    finite(source.ywin_image),
                    source.alpha_j2000.and_then(finite),
                    source.delta_j2000.and_then(finite),
                    finite(source.mag_auto),
                    finite(source.flux_auto),
                    finite(source.background),
                    finite(source.fwhm_image),
                    source.flags,
                    finite(source.class_star),
                ])?;
            }
        }

        tx.commit()?;

        log::debug!(
            "✅ Stored image_statistics id={} with {} catalog rows",
            image_id,
            catalog.len()
        );

        Ok(image_id)
    }

    async fn query_by_filter_since(
        &self,
        filter: &str,
        window: Duration,
    ) -> Result<Vec<ImageQualityRecord>, PersistenceError> {
        let now_ms = (self.now_fn)();
        let end = DateTime::<Utc>::from_timestamp_millis(now_ms)
            .ok_or_else(|| PersistenceError::Schema(format!("clock out of range: {}", now_ms)))?;
        // Windows reaching past the representable range cover all history
        let start = end.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.query_between(filter, start, end)
    }

    async fn distinct_filters(&self) -> Result<Vec<String>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT filter FROM image_statistics ORDER BY filter")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut filters = Vec::new();
        for row in rows {
            filters.push(row?);
        }
        Ok(filters)
    }

    async fn catalog_for(&self, image_id: i64) -> Result<Vec<SourceCatalogEntry>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, image_statistics_id, number, x_image, y_image, xwin_image, ywin_image,
                    alpha_j2000, delta_j2000, mag_auto, flux_auto, background, fwhm_image,
                    flags, class_star
             FROM image_catalog
             WHERE image_statistics_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([image_id], row_to_catalog_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
