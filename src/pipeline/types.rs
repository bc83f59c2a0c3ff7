//! Core data structures for the image-quality pipeline
//!
//! Table mapping (see `sql/`):
//! - `image_statistics` → `ImageQualityRecord` (written from `NewImageQuality`)
//! - `image_catalog` → `SourceCatalogEntry` (written from ranked `SourceRecord`s)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel filter name used when the exposure carries no FILTER keyword
pub const DEFAULT_FILTER: &str = "CLEAR";

/// One detected source as emitted by the extractor
///
/// Field names follow the extractor's catalog columns (NUMBER, X_IMAGE, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub number: i64,
    pub x_image: f64,
    pub y_image: f64,
    pub xwin_image: f64,
    pub ywin_image: f64,
    /// Sky coordinates, only present when the image carries a WCS solution
    pub alpha_j2000: Option<f64>,
    pub delta_j2000: Option<f64>,
    pub mag_auto: f64,
    pub flux_auto: f64,
    pub background: f64,
    pub fwhm_image: f64,
    /// 0 = clean detection
    pub flags: i64,
    /// Star/galaxy classifier in [0, 1]
    pub class_star: f64,
}

/// Image-level metrics computed over the usable sources only
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    pub fwhm_avg: f64,
    pub fwhm_std: f64,
    pub background_avg: f64,
    /// Number of sources that passed the usability mask
    pub npts: i64,
}

/// Exposure attributes copied from the originating event's headers
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureInfo {
    pub filename: String,
    pub filter: String,
    pub exptime: Option<f64>,
    pub date_obs: DateTime<Utc>,
}

/// Image-quality row ready for insertion (identity not yet assigned)
#[derive(Debug, Clone, PartialEq)]
pub struct NewImageQuality {
    pub exposure: ExposureInfo,
    pub metrics: QualityMetrics,
}

/// Stored image-quality row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageQualityRecord {
    pub id: i64,
    pub filename: String,
    pub filter: String,
    pub exptime: Option<f64>,
    pub date_obs: DateTime<Utc>,
    pub fwhm_avg: f64,
    pub fwhm_std: f64,
    pub background: f64,
    pub npts: i64,
}

/// Stored catalog row, owned by one `ImageQualityRecord`
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCatalogEntry {
    pub id: i64,
    pub image_statistics_id: i64,
    pub source: SourceRecord,
}

/// Cached per-filter snapshot produced by one aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingFilterSummary {
    pub last_update: DateTime<Utc>,
    /// npts-weighted mean of per-image FWHM averages
    pub fwhm_avg: f64,
    /// npts-weighted mean of per-image background averages
    pub background_avg: f64,
    pub n_images: usize,
}

/// Raw time series for one filter; index `i` of every vector is the same record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterSeries {
    pub date_obs: Vec<DateTime<Utc>>,
    pub fwhm: Vec<f64>,
    pub background: Vec<f64>,
}

impl FilterSeries {
    pub fn push(&mut self, record: &ImageQualityRecord) {
        self.date_obs.push(record.date_obs);
        self.fwhm.push(record.fwhm_avg);
        self.background.push(record.background);
    }

    pub fn len(&self) -> usize {
        self.date_obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.date_obs.is_empty()
    }
}
