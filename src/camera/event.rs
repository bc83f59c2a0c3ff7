//! Exposure-completion events as delivered by the camera proxy
//!
//! The camera framework owns these; imgqc only reads them. Events arrive as
//! one JSON object per readout (see `subscription.rs`), e.g.
//!
//! ```json
//! {"filename": "C:\\images\\20240101\\obj-0001.fits",
//!  "url": "http://camera-host:9001/image/obj-0001.fits",
//!  "status": "OK",
//!  "headers": {"IMAGETYP": "OBJECT", "SHUTTER": "OPEN", "FILTER": "R",
//!              "DATE-OBS": "2024-01-01T03:04:05.123", "EXPTIME": 30.0}}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header keyword for the frame type ("OBJECT", "BIAS", "FLAT", ...)
pub const KEY_FRAME_TYPE: &str = "IMAGETYP";
/// Header keyword for the shutter state
pub const KEY_SHUTTER: &str = "SHUTTER";
/// Header keyword for the optical filter
pub const KEY_FILTER: &str = "FILTER";
/// Header keyword for the observation start (UTC, ISO-8601 without zone)
pub const KEY_DATE_OBS: &str = "DATE-OBS";
/// Header keyword for the exposure time in seconds
pub const KEY_EXPTIME: &str = "EXPTIME";

/// Camera acquisition status reported with the readout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadoutStatus {
    Ok,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl ReadoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadoutStatus::Ok => "OK",
            ReadoutStatus::Error => "ERROR",
            ReadoutStatus::Aborted => "ABORTED",
            ReadoutStatus::Unknown => "UNKNOWN",
        }
    }
}

/// A single image header value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; text values holding a number are accepted too
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Integer(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Text(s) => s.trim().parse().ok(),
            HeaderValue::Flag(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

/// One completed camera readout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureEvent {
    /// Image path as known to the camera host (may use `\` separators)
    pub filename: String,
    /// Remote locator served by the camera host's image server
    #[serde(default)]
    pub url: Option<String>,
    pub status: ReadoutStatus,
    #[serde(default)]
    pub headers: HashMap<String, HeaderValue>,
}

impl ExposureEvent {
    pub fn new(filename: impl Into<String>, status: ReadoutStatus) -> Self {
        Self {
            filename: filename.into(),
            url: None,
            status,
            headers: HashMap::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    /// Case-insensitive header lookup (FITS keywords are uppercase by convention)
    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key).or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header(key).and_then(HeaderValue::as_str)
    }

    /// True when `key` holds a text value equal to `expected`, ignoring case
    /// and surrounding whitespace. Missing or non-text values never match.
    pub fn header_matches(&self, key: &str, expected: &str) -> bool {
        self.header_str(key)
            .map(|v| v.trim().eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}
