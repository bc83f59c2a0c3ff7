//! Rolling per-filter quality summaries
//!
//! On every control tick the aggregator re-queries the trailing window for
//! each known filter and replaces that filter's cached summary wholesale.
//! An empty window (or a failed query) leaves the previous summary in place.

use super::db::{PersistenceError, QualityStore};
use super::types::{FilterSeries, ImageQualityRecord, RollingFilterSummary};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::interval;

/// Default trailing window for the cached summaries
pub const DEFAULT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Aggregating,
}

pub struct RollingAggregator {
    store: Arc<dyn QualityStore>,
    /// Configured filters; empty means "whatever storage has seen"
    filters: Vec<String>,
    window: Duration,
    state: Mutex<AggregatorState>,
    summaries: Arc<RwLock<HashMap<String, RollingFilterSummary>>>,
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl RollingAggregator {
    pub fn new(store: Arc<dyn QualityStore>, filters: Vec<String>, window: Duration) -> Self {
        Self::new_with_clock(store, filters, window, Box::new(Utc::now))
    }

    /// Custom clock for `last_update` stamps (tests)
    pub fn new_with_clock(
        store: Arc<dyn QualityStore>,
        filters: Vec<String>,
        window: Duration,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            store,
            filters,
            window,
            state: Mutex::new(AggregatorState::Idle),
            summaries: Arc::new(RwLock::new(HashMap::new())),
            now_fn,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(AggregatorState::Idle)
    }

    fn set_state(&self, next: AggregatorState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Filters to report on this cycle
    pub async fn known_filters(&self) -> Result<Vec<String>, PersistenceError> {
        if !self.filters.is_empty() {
            return Ok(self.filters.clone());
        }
        self.store.distinct_filters().await
    }

    /// One Idle → Aggregating → Idle pass over every known filter
    ///
    /// Returns the number of summaries replaced.
    pub async fn run_cycle(&self) -> usize {
        self.set_state(AggregatorState::Aggregating);
        let updated = self.aggregate().await;
        self.set_state(AggregatorState::Idle);
        updated
    }

    async fn aggregate(&self) -> usize {
        let filters = match self.known_filters().await {
            Ok(filters) => filters,
            Err(e) => {
                log::error!("❌ Failed to list filters: {}", e);
                return 0;
            }
        };

        // Compute outside the lock, publish in one write
        let mut fresh = Vec::with_capacity(filters.len());
        for filter in filters {
            let records = match self.store.query_by_filter_since(&filter, self.window).await {
                Ok(records) => records,
                Err(e) => {
                    log::error!("❌ Query failed for filter {}: {}", filter, e);
                    continue;
                }
            };

            match summarize(&records, (self.now_fn)()) {
                Some(summary) => {
                    log::debug!(
                        "Filter {}: n_images={}, fwhm_avg={:.3}, back_avg={:.2}",
                        filter,
                        summary.n_images,
                        summary.fwhm_avg,
                        summary.background_avg
                    );
                    fresh.push((filter, summary));
                }
                None => log::debug!("Filter {}: no images in window, keeping last summary", filter),
            }
        }

        let updated = fresh.len();
        if updated > 0 {
            let mut summaries = self.summaries.write().await;
            for (filter, summary) in fresh {
                summaries.insert(filter, summary);
            }
        }
        updated
    }

    /// Copy of the cached summaries
    pub async fn summaries(&self) -> HashMap<String, RollingFilterSummary> {
        self.summaries.read().await.clone()
    }

    pub async fn summary(&self, filter: &str) -> Option<RollingFilterSummary> {
        self.summaries.read().await.get(filter).cloned()
    }

    /// Raw series for the last `minutes`, straight from storage
    ///
    /// Every known filter gets an entry, empty when it has no data.
    pub async fn image_statistics(
        &self,
        minutes: i64,
    ) -> Result<HashMap<String, FilterSeries>, PersistenceError> {
        let window = Duration::try_minutes(minutes).unwrap_or(if minutes > 0 {
            Duration::max_value()
        } else {
            Duration::zero()
        });
        let mut series = HashMap::new();

        for filter in self.known_filters().await? {
            let records = self.store.query_by_filter_since(&filter, window).await?;
            let mut entry = FilterSeries::default();
            for record in &records {
                entry.push(record);
            }
            series.insert(filter, entry);
        }

        Ok(series)
    }
}

/// npts-weighted averages; `None` for an empty window
pub fn summarize(
    records: &[ImageQualityRecord],
    now: DateTime<Utc>,
) -> Option<RollingFilterSummary> {
    let weight: f64 = records.iter().map(|r| r.npts as f64).sum();
    if records.is_empty() || weight <= 0.0 {
        return None;
    }

    let fwhm: f64 = records.iter().map(|r| r.fwhm_avg * r.npts as f64).sum();
    let background: f64 = records.iter().map(|r| r.background * r.npts as f64).sum();

    Some(RollingFilterSummary {
        last_update: now,
        fwhm_avg: fwhm / weight,
        background_avg: background / weight,
        n_images: records.len(),
    })
}

#[derive(Debug, Serialize)]
struct SummarySnapshot<'a> {
    generated_at: DateTime<Utc>,
    filters: BTreeMap<&'a str, &'a RollingFilterSummary>,
}

/// Write the cached summaries to a JSON file
pub fn save_summary_snapshot(
    summaries: &HashMap<String, RollingFilterSummary>,
    file_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = SummarySnapshot {
        generated_at: Utc::now(),
        filters: summaries.iter().map(|(k, v)| (k.as_str(), v)).collect(),
    };

    let json = serde_json::to_string_pretty(&snapshot)?;
    fs::write(file_path, json)?;

    log::debug!("Saved {} filter summaries to {}", summaries.len(), file_path);
    Ok(())
}

/// Control loop: one aggregation cycle per tick, runs until aborted
pub async fn aggregator_task(
    aggregator: Arc<RollingAggregator>,
    tick: std::time::Duration,
    summary_path: Option<String>,
) {
    log::info!("⏱️  Aggregator started");
    log::info!("   ├─ Cadence: {}ms", tick.as_millis());
    log::info!("   └─ Window: {} min", aggregator.window.num_minutes());

    let mut timer = interval(tick);

    loop {
        timer.tick().await;

        let updated = aggregator.run_cycle().await;
        log::debug!("Aggregation cycle complete ({} filters updated)", updated);

        if let Some(path) = &summary_path {
            let summaries = aggregator.summaries().await;
            if let Err(e) = save_summary_snapshot(&summaries, path) {
                log::warn!("Failed to save summary snapshot: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::{run_schema_migrations, SqliteQualityStore};
    use crate::pipeline::types::{ExposureInfo, NewImageQuality, QualityMetrics};
    use chrono::TimeZone;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::NamedTempFile;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
    }

    /// Store whose clock is driven by the returned cell (epoch ms)
    fn clocked_store() -> (Arc<SqliteQualityStore>, Arc<AtomicI64>, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_db.path()).unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();
        drop(conn);

        let clock = Arc::new(AtomicI64::new(t0().timestamp_millis()));
        let reader = clock.clone();
        let store = SqliteQualityStore::new_with_clock(
            temp_db.path(),
            Box::new(move || reader.load(Ordering::SeqCst)),
        )
        .unwrap();
        (Arc::new(store), clock, temp_db)
    }

    fn aggregator_for(
        store: Arc<SqliteQualityStore>,
        clock: Arc<AtomicI64>,
        filters: Vec<String>,
    ) -> RollingAggregator {
        RollingAggregator::new_with_clock(
            store,
            filters,
            Duration::minutes(DEFAULT_WINDOW_MINUTES),
            Box::new(move || {
                DateTime::<Utc>::from_timestamp_millis(clock.load(Ordering::SeqCst)).unwrap()
            }),
        )
    }

    async fn insert(
        store: &SqliteQualityStore,
        filter: &str,
        date_obs: DateTime<Utc>,
        fwhm: f64,
        background: f64,
        npts: i64,
    ) {
        let record = NewImageQuality {
            exposure: ExposureInfo {
                filename: format!("{}-{}.fits", filter, date_obs.timestamp()),
                filter: filter.to_string(),
                exptime: Some(10.0),
                date_obs,
            },
            metrics: QualityMetrics {
                fwhm_avg: fwhm,
                fwhm_std: 0.1,
                background_avg: background,
                npts,
            },
        };
        store.save(record, Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_weighted_summary() {
        let (store, clock, _db) = clocked_store();
        insert(&store, "R", t0() - Duration::minutes(5), 2.0, 100.0, 10).await;
        insert(&store, "R", t0() - Duration::minutes(15), 4.0, 200.0, 30).await;
        // Outside the window
        insert(&store, "R", t0() - Duration::minutes(45), 9.0, 900.0, 50).await;

        let aggregator = aggregator_for(store, clock, Vec::new());
        assert_eq!(aggregator.run_cycle().await, 1);
        assert_eq!(aggregator.state(), AggregatorState::Idle);

        let summary = aggregator.summary("R").await.unwrap();
        assert_eq!(summary.n_images, 2);
        assert!((summary.fwhm_avg - 3.5).abs() < 1e-12);
        assert!((summary.background_avg - 175.0).abs() < 1e-12);
        assert_eq!(summary.last_update, t0());
    }

    #[tokio::test]
    async fn test_empty_window_keeps_previous_summary() {
        let (store, clock, _db) = clocked_store();
        insert(&store, "V", t0() - Duration::minutes(1), 2.5, 120.0, 8).await;

        let aggregator = aggregator_for(store, clock.clone(), vec!["V".to_string()]);

        aggregator.run_cycle().await;
        let first = aggregator.summary("V").await.unwrap();

        // Two more cycles after the record left the window
        clock.fetch_add(Duration::minutes(40).num_milliseconds(), Ordering::SeqCst);
        assert_eq!(aggregator.run_cycle().await, 0);
        clock.fetch_add(Duration::minutes(10).num_milliseconds(), Ordering::SeqCst);
        assert_eq!(aggregator.run_cycle().await, 0);

        assert_eq!(aggregator.summary("V").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_summary_replaced_wholesale() {
        let (store, clock, _db) = clocked_store();
        insert(&store, "B", t0() - Duration::minutes(2), 2.0, 100.0, 5).await;
        let aggregator = aggregator_for(store.clone(), clock.clone(), Vec::new());
        aggregator.run_cycle().await;

        clock.fetch_add(Duration::minutes(40).num_milliseconds(), Ordering::SeqCst);
        insert(&store, "B", t0() + Duration::minutes(39), 6.0, 300.0, 5).await;
        aggregator.run_cycle().await;

        let summary = aggregator.summary("B").await.unwrap();
        assert_eq!(summary.n_images, 1);
        assert_eq!(summary.fwhm_avg, 6.0);
        assert_eq!(summary.last_update, t0() + Duration::minutes(40));
    }

    #[tokio::test]
    async fn test_image_statistics_parallel_series() {
        let (store, clock, _db) = clocked_store();
        let times = [25, 3, 12];
        for (i, minutes_ago) in times.iter().enumerate() {
            insert(
                &store,
                "R",
                t0() - Duration::minutes(*minutes_ago),
                2.0 + i as f64,
                100.0 + i as f64,
                4,
            )
            .await;
        }
        insert(&store, "R", t0() - Duration::minutes(31), 8.0, 800.0, 4).await;
        insert(&store, "I", t0() - Duration::minutes(90), 3.0, 50.0, 4).await;

        let aggregator = aggregator_for(store, clock, Vec::new());
        let stats = aggregator.image_statistics(30).await.unwrap();

        let r = &stats["R"];
        assert_eq!(r.len(), 3);
        assert_eq!(r.fwhm.len(), 3);
        assert_eq!(r.background.len(), 3);
        // Ordered by observation time; index i is one record
        assert_eq!(r.date_obs[0], t0() - Duration::minutes(25));
        assert_eq!((r.fwhm[0], r.background[0]), (2.0, 100.0));
        assert_eq!((r.fwhm[1], r.background[1]), (4.0, 102.0));
        assert_eq!((r.fwhm[2], r.background[2]), (3.0, 101.0));

        // Known filter with nothing recent still appears
        assert!(stats["I"].is_empty());

        // Wider window reaches older rows; cache is not consulted
        assert_eq!(aggregator.image_statistics(120).await.unwrap()["I"].len(), 1);
        assert!(aggregator.summaries().await.is_empty());
    }

    #[tokio::test]
    async fn test_image_statistics_extreme_minutes() {
        let (store, clock, _db) = clocked_store();
        insert(&store, "R", t0() - Duration::minutes(10), 2.0, 100.0, 4).await;
        insert(&store, "R", t0() - Duration::days(3650), 3.0, 110.0, 4).await;

        let aggregator = aggregator_for(store, clock, Vec::new());

        let everything = aggregator.image_statistics(1_000_000_000_000).await.unwrap();
        assert_eq!(everything["R"].len(), 2);

        let widest = aggregator.image_statistics(i64::MAX).await.unwrap();
        assert_eq!(widest["R"].len(), 2);

        let nothing = aggregator.image_statistics(i64::MIN).await.unwrap();
        assert!(nothing["R"].is_empty());
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(summarize(&[], t0()), None);
    }

    #[test]
    fn test_save_summary_snapshot() {
        let mut summaries = HashMap::new();
        summaries.insert(
            "R".to_string(),
            RollingFilterSummary {
                last_update: t0(),
                fwhm_avg: 2.5,
                background_avg: 110.0,
                n_images: 3,
            },
        );
        let file = NamedTempFile::new().unwrap();

        save_summary_snapshot(&summaries, file.path().to_str().unwrap()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(json["filters"]["R"]["n_images"], 3);
        assert_eq!(json["filters"]["R"]["fwhm_avg"], 2.5);
    }
}
