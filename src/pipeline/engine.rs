//! Per-exposure statistics pipeline
//!
//! One run per eligible readout:
//! 1. Exposure metadata (filter, exposure time, observation time) from headers
//! 2. Resolve the image locally, fetching it when needed
//! 3. Run the source extractor
//! 4. Reduce the detection table to quality metrics + ranked catalog
//! 5. Persist record and catalog in one transaction
//!
//! Any failure aborts only the current run. Nothing is retried.

use super::db::{PersistenceError, QualityStore};
use super::reduction::{reduce, InsufficientDataError, UsabilityMask};
use super::types::{ExposureInfo, NewImageQuality, DEFAULT_FILTER};
use crate::camera::event::{ExposureEvent, KEY_DATE_OBS, KEY_EXPTIME, KEY_FILTER};
use crate::camera::extractor::{ExtractionError, ExtractorParams, SourceExtractor};
use crate::camera::resolver::{ImageResolver, ImageRetrievalError, ResolvedImage};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;

/// Default upper bound on stored catalog entries per image
pub const DEFAULT_MAX_CATALOG: usize = 100;

/// DATE-OBS layout written by the camera (UTC, fraction optional)
const DATE_OBS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Why a pipeline run stopped
#[derive(Debug)]
pub enum PipelineError {
    MalformedMetadata(String),
    ImageRetrieval(ImageRetrievalError),
    Extraction(ExtractionError),
    InsufficientData(InsufficientDataError),
    Persistence(PersistenceError),
}

impl From<ImageRetrievalError> for PipelineError {
    fn from(err: ImageRetrievalError) -> Self {
        PipelineError::ImageRetrieval(err)
    }
}

impl From<ExtractionError> for PipelineError {
    fn from(err: ExtractionError) -> Self {
        PipelineError::Extraction(err)
    }
}

impl From<InsufficientDataError> for PipelineError {
    fn from(err: InsufficientDataError) -> Self {
        PipelineError::InsufficientData(err)
    }
}

impl From<PersistenceError> for PipelineError {
    fn from(err: PersistenceError) -> Self {
        PipelineError::Persistence(err)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::MalformedMetadata(msg) => write!(f, "Malformed metadata: {}", msg),
            PipelineError::ImageRetrieval(e) => write!(f, "{}", e),
            PipelineError::Extraction(e) => write!(f, "Extraction failed: {}", e),
            PipelineError::InsufficientData(e) => write!(f, "{}", e),
            PipelineError::Persistence(e) => write!(f, "Persistence failed: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// Data-quality outcomes rather than faults (logged at warn, not error)
    pub fn is_data_issue(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedMetadata(_) | PipelineError::InsufficientData(_)
        )
    }
}

/// Successful end of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Record stored under this identity
    Stored(i64),
    /// The extractor found nothing; nothing to persist
    NoSources,
}

/// Image → extractor → reduction → storage
pub struct StatsPipeline {
    resolver: ImageResolver,
    extractor: Arc<dyn SourceExtractor>,
    params: Arc<ExtractorParams>,
    store: Arc<dyn QualityStore>,
    max_catalog: usize,
    mask: UsabilityMask,
    keep_fetched: bool,
}

impl StatsPipeline {
    pub fn new(
        resolver: ImageResolver,
        extractor: Arc<dyn SourceExtractor>,
        params: Arc<ExtractorParams>,
        store: Arc<dyn QualityStore>,
    ) -> Self {
        Self {
            resolver,
            extractor,
            params,
            store,
            max_catalog: DEFAULT_MAX_CATALOG,
            mask: UsabilityMask::default(),
            keep_fetched: false,
        }
    }

    pub fn with_max_catalog(mut self, max_catalog: usize) -> Self {
        self.max_catalog = max_catalog;
        self
    }

    pub fn with_mask(mut self, mask: UsabilityMask) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_keep_fetched(mut self, keep_fetched: bool) -> Self {
        self.keep_fetched = keep_fetched;
        self
    }

    /// Run the full pipeline for one eligible exposure
    pub async fn process(&self, event: &ExposureEvent) -> Result<RunOutcome, PipelineError> {
        let exposure = exposure_info(event)?;

        let image = self.resolver.resolve(event).await?;
        let extracted = self.extractor.extract(&image.path, &self.params).await;
        self.release(&image).await;
        let sources = extracted?;

        if sources.is_empty() {
            log::info!("🔭 No sources detected in {}", exposure.filename);
            return Ok(RunOutcome::NoSources);
        }

        let reduction = reduce(&sources, self.max_catalog, &self.mask)?;
        let metrics = reduction.metrics;

        let id = self
            .store
            .save(NewImageQuality { exposure: exposure.clone(), metrics }, reduction.catalog)
            .await?;

        log::info!("✅ Image statistics stored: {} (id={})", exposure.filename, id);
        log::info!("   ├─ Filter: {}", exposure.filter);
        log::info!(
            "   ├─ FWHM: {:.3} ± {:.3} px",
            metrics.fwhm_avg,
            metrics.fwhm_std
        );
        log::info!("   ├─ Background: {:.2}", metrics.background_avg);
        log::info!("   └─ Usable sources: {}/{}", metrics.npts, sources.len());

        Ok(RunOutcome::Stored(id))
    }

    /// Remove a downloaded image once the extractor is done with it
    async fn release(&self, image: &ResolvedImage) {
        if !image.fetched || self.keep_fetched {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(&image.path).await {
            log::warn!("⚠️  Could not remove {}: {}", image.path.display(), e);
        }
    }
}

/// Exposure attributes copied from the event headers
///
/// FILTER defaults to `CLEAR`. DATE-OBS is required. EXPTIME may be absent
/// but must be numeric when present.
pub fn exposure_info(event: &ExposureEvent) -> Result<ExposureInfo, PipelineError> {
    let filter = event
        .header_str(KEY_FILTER)
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string();

    let raw_date = event.header_str(KEY_DATE_OBS).ok_or_else(|| {
        PipelineError::MalformedMetadata(format!("{} missing in {}", KEY_DATE_OBS, event.filename))
    })?;
    let date_obs = parse_date_obs(raw_date).ok_or_else(|| {
        PipelineError::MalformedMetadata(format!("unparseable {}: {:?}", KEY_DATE_OBS, raw_date))
    })?;

    let exptime = match event.header(KEY_EXPTIME) {
        None => None,
        Some(value) => Some(value.as_f64().ok_or_else(|| {
            PipelineError::MalformedMetadata(format!("non-numeric {}: {:?}", KEY_EXPTIME, value))
        })?),
    };

    Ok(ExposureInfo {
        filename: event.filename.clone(),
        filter,
        exptime,
        date_obs,
    })
}

/// Naive timestamps are UTC; explicit offsets are honored
pub fn parse_date_obs(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, DATE_OBS_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
        .ok()
}
