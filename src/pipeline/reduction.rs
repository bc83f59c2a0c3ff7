//! Quality reduction: source table → image-level metrics + ranked sub-catalog
//!
//! Two independent passes over the extractor output:
//! 1. Usability mask (class_star > threshold AND flags == 0) → averages over
//!    the usable subset only.
//! 2. Brightness ranking over the FULL table (ascending MAG_AUTO, stable) →
//!    at most `max_catalog_size` catalog candidates.

use super::types::{QualityMetrics, SourceRecord};
use std::cmp::Ordering;

/// Default classifier threshold for the usability mask
pub const DEFAULT_MIN_CLASS_STAR: f64 = 0.8;

/// No source survived the usability mask
#[derive(Debug, Clone, PartialEq)]
pub struct InsufficientDataError {
    /// Number of sources the extractor reported
    pub detected: usize,
}

impl std::fmt::Display for InsufficientDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Insufficient data: 0 of {} detected sources passed the usability mask",
            self.detected
        )
    }
}

impl std::error::Error for InsufficientDataError {}

/// Selects sources reliable enough to contribute to quality statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsabilityMask {
    /// Strict lower bound on class_star
    pub min_class_star: f64,
}

impl Default for UsabilityMask {
    fn default() -> Self {
        Self {
            min_class_star: DEFAULT_MIN_CLASS_STAR,
        }
    }
}

impl UsabilityMask {
    pub fn new(min_class_star: f64) -> Self {
        Self { min_class_star }
    }

    pub fn is_usable(&self, record: &SourceRecord) -> bool {
        record.class_star > self.min_class_star && record.flags == 0
    }
}

/// Output of `reduce`
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub metrics: QualityMetrics,
    /// Brightest-first, at most `max_catalog_size` entries
    pub catalog: Vec<SourceRecord>,
}

/// Reduce a detection table to image-level metrics and catalog candidates
///
/// Returns `InsufficientDataError` when no record passes the mask, which
/// includes the empty input. Statistics are never fabricated as NaN.
pub fn reduce(
    records: &[SourceRecord],
    max_catalog_size: usize,
    mask: &UsabilityMask,
) -> Result<Reduction, InsufficientDataError> {
    let usable: Vec<&SourceRecord> = records.iter().filter(|r| mask.is_usable(r)).collect();

    if usable.is_empty() {
        return Err(InsufficientDataError {
            detected: records.len(),
        });
    }

    let fwhm: Vec<f64> = usable.iter().map(|r| r.fwhm_image).collect();
    let background: Vec<f64> = usable.iter().map(|r| r.background).collect();

    let fwhm_avg = mean(&fwhm);
    let metrics = QualityMetrics {
        fwhm_avg,
        fwhm_std: population_std(&fwhm, fwhm_avg),
        background_avg: mean(&background),
        npts: usable.len() as i64,
    };

    Ok(Reduction {
        metrics,
        catalog: rank_catalog(records, max_catalog_size),
    })
}

/// Up to `max` records ordered by ascending magnitude
///
/// `sort_by` is stable, so equal magnitudes keep extractor emission order.
/// Non-finite magnitudes sort after every finite one.
pub fn rank_catalog(records: &[SourceRecord], max: usize) -> Vec<SourceRecord> {
    let mut ranked: Vec<&SourceRecord> = records.iter().collect();
    ranked.sort_by(|a, b| compare_magnitude(a.mag_auto, b.mag_auto));
    ranked.into_iter().take(max).cloned().collect()
}

fn compare_magnitude(a: f64, b: f64) -> Ordering {
    match (a.is_finite(), b.is_finite()) {
        (true, true) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
