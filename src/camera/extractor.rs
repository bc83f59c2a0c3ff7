//! Source-detection adapter over an external SExtractor-compatible program
//!
//! Each call runs the tool in its own scratch directory (created with
//! `tempfile`, removed on drop) so concurrent pipeline runs never share a
//! catalog or parameter file. The tool is asked for an ASCII_HEAD catalog:
//!
//! ```text
//! #   1 NUMBER                 Running object number
//! #   2 X_IMAGE                Object position along x            [pixel]
//! ...
//!          1   1023.512   88.201 ...
//! ```

use crate::pipeline::config::ConfigError;
use crate::pipeline::types::SourceRecord;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Option key holding the requested field list; always overridden
pub const PARAMETERS_LIST_KEY: &str = "PARAMETERS_LIST";

/// Options the adapter owns per call; values from the parameter file are ignored
const RESERVED_KEYS: [&str; 4] = [
    PARAMETERS_LIST_KEY,
    "CATALOG_NAME",
    "CATALOG_TYPE",
    "PARAMETERS_NAME",
];

/// Measured quantities every extraction must return
pub const REQUIRED_FIELDS: [&str; 13] = [
    "NUMBER",
    "X_IMAGE",
    "Y_IMAGE",
    "XWIN_IMAGE",
    "YWIN_IMAGE",
    "ALPHA_J2000",
    "DELTA_J2000",
    "MAG_AUTO",
    "FLUX_AUTO",
    "BACKGROUND",
    "FWHM_IMAGE",
    "FLAGS",
    "CLASS_STAR",
];

/// Sky coordinates are optional in the catalog (no WCS → no column)
const OPTIONAL_FIELDS: [&str; 2] = ["ALPHA_J2000", "DELTA_J2000"];

#[derive(Debug)]
pub enum ExtractionError {
    Io(std::io::Error),
    Spawn { program: String, error: std::io::Error },
    ToolFailed { code: Option<i32>, stderr: String },
    MalformedCatalog(String),
}

impl From<std::io::Error> for ExtractionError {
    fn from(err: std::io::Error) -> Self {
        ExtractionError::Io(err)
    }
}

impl std::fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionError::Io(e) => write!(f, "IO error: {}", e),
            ExtractionError::Spawn { program, error } => {
                write!(f, "Failed to start extractor '{}': {}", program, error)
            }
            ExtractionError::ToolFailed { code, stderr } => match code {
                Some(code) => write!(f, "Extractor exited with status {}: {}", code, stderr),
                None => write!(f, "Extractor terminated by signal: {}", stderr),
            },
            ExtractionError::MalformedCatalog(msg) => write!(f, "Malformed catalog: {}", msg),
        }
    }
}

impl std::error::Error for ExtractionError {}

/// Extractor configuration, loaded once at startup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractorParams {
    options: Map<String, Value>,
}

impl ExtractorParams {
    /// Load options from an optional JSON file (`~` is expanded)
    ///
    /// `PARAMETERS_LIST` is always replaced by `REQUIRED_FIELDS`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let path = expand_home(path);
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::InvalidValue(format!(
                        "cannot read extractor params {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_json_str(&json)
            }
            None => Ok(Self::from_options(Map::new())),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(options)) => Ok(Self::from_options(options)),
            Ok(_) => Err(ConfigError::InvalidValue(
                "extractor params must be a JSON object".to_string(),
            )),
            Err(e) => Err(ConfigError::InvalidValue(format!(
                "extractor params are not valid JSON: {}",
                e
            ))),
        }
    }

    fn from_options(mut options: Map<String, Value>) -> Self {
        options.insert(
            PARAMETERS_LIST_KEY.to_string(),
            Value::Array(REQUIRED_FIELDS.iter().map(|f| Value::from(*f)).collect()),
        );
        Self { options }
    }

    /// Requested catalog columns
    pub fn fields(&self) -> Vec<String> {
        match self.options.get(PARAMETERS_LIST_KEY) {
            Some(Value::Array(fields)) => fields
                .iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect(),
            _ => REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Tool options as `-KEY value` pairs, reserved keys excluded
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.options {
            if RESERVED_KEYS.iter().any(|r| r.eq_ignore_ascii_case(key)) {
                continue;
            }
            args.push(format!("-{}", key.to_uppercase()));
            args.push(render_option(value));
        }
        args
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }
}

fn render_option(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "Y".to_string(),
        Value::Bool(false) => "N".to_string(),
        Value::Array(items) => items.iter().map(render_option).collect::<Vec<_>>().join(","),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Source detection on a locally readable image
///
/// Stateless across calls; an image with no detections yields `Ok(vec![])`.
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    async fn extract(
        &self,
        image: &Path,
        params: &ExtractorParams,
    ) -> Result<Vec<SourceRecord>, ExtractionError>;
}

/// Runs the SExtractor command-line program
#[derive(Debug, Clone)]
pub struct SExtractor {
    program: String,
}

impl SExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl SourceExtractor for SExtractor {
    async fn extract(
        &self,
        image: &Path,
        params: &ExtractorParams,
    ) -> Result<Vec<SourceRecord>, ExtractionError> {
        // The tool runs inside the scratch dir; relative image paths must not leak in
        let image = tokio::fs::canonicalize(image).await?;
        let scratch = tempfile::Builder::new().prefix("imgqc-extract-").tempdir()?;
        let catalog_path = scratch.path().join("catalog.cat");
        let param_path = scratch.path().join("fields.param");

        tokio::fs::write(&param_path, params.fields().join("\n") + "\n").await?;

        log::debug!(
            "🔭 Extracting sources from {} (scratch: {})",
            image.display(),
            scratch.path().display()
        );

        let output = Command::new(&self.program)
            .arg(&image)
            .args(params.command_args())
            .arg("-CATALOG_NAME")
            .arg(&catalog_path)
            .arg("-CATALOG_TYPE")
            .arg("ASCII_HEAD")
            .arg("-PARAMETERS_NAME")
            .arg(&param_path)
            .current_dir(scratch.path())
            .output()
            .await
            .map_err(|error| ExtractionError::Spawn {
                program: self.program.clone(),
                error,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::ToolFailed {
                code: output.status.code(),
                stderr: last_line(&stderr),
            });
        }

        let catalog = tokio::fs::read_to_string(&catalog_path).await.map_err(|e| {
            ExtractionError::MalformedCatalog(format!("catalog not written: {}", e))
        })?;

        parse_ascii_head(&catalog)
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Parse an ASCII_HEAD catalog into source records, preserving row order
pub fn parse_ascii_head(text: &str) -> Result<Vec<SourceRecord>, ExtractionError> {
    let mut columns: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<(usize, Vec<f64>)> = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('#') {
            let mut parts = header.split_whitespace();
            let index = parts.next().and_then(|i| i.parse::<usize>().ok());
            let name = parts.next();
            match (index, name) {
                (Some(index), Some(name)) if index >= 1 => {
                    columns.insert(name.to_uppercase(), index - 1);
                }
                _ => {
                    return Err(ExtractionError::MalformedCatalog(format!(
                        "bad header at line {}: {}",
                        line_no + 1,
                        line
                    )))
                }
            }
            continue;
        }

        let values = line
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| {
                ExtractionError::MalformedCatalog(format!("line {}: {}", line_no + 1, e))
            })?;
        rows.push((line_no + 1, values));
    }

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let layout = CatalogLayout::from_columns(&columns)?;
    rows.iter()
        .map(|(line_no, values)| layout.record(*line_no, values))
        .collect()
}

/// Column positions resolved from the catalog header
struct CatalogLayout {
    required: HashMap<&'static str, usize>,
    alpha: Option<usize>,
    delta: Option<usize>,
}

impl CatalogLayout {
    fn from_columns(columns: &HashMap<String, usize>) -> Result<Self, ExtractionError> {
        let mut required = HashMap::new();
        for field in REQUIRED_FIELDS {
            if OPTIONAL_FIELDS.contains(&field) {
                continue;
            }
            let index = columns.get(field).ok_or_else(|| {
                ExtractionError::MalformedCatalog(format!("missing column {}", field))
            })?;
            required.insert(field, *index);
        }

        Ok(Self {
            required,
            alpha: columns.get("ALPHA_J2000").copied(),
            delta: columns.get("DELTA_J2000").copied(),
        })
    }

    fn record(&self, line_no: usize, values: &[f64]) -> Result<SourceRecord, ExtractionError> {
        let get = |field: &str| -> Result<f64, ExtractionError> {
            self.required
                .get(field)
                .and_then(|i| values.get(*i))
                .copied()
                .ok_or_else(|| {
                    ExtractionError::MalformedCatalog(format!(
                        "line {}: no value for {}",
                        line_no, field
                    ))
                })
        };

        Ok(SourceRecord {
            number: get("NUMBER")? as i64,
            x_image: get("X_IMAGE")?,
            y_image: get("Y_IMAGE")?,
            xwin_image: get("XWIN_IMAGE")?,
            ywin_image: get("YWIN_IMAGE")?,
            alpha_j2000: self.alpha.and_then(|i| values.get(i).copied()),
            delta_j2000: self.delta.and_then(|i| values.get(i).copied()),
            mag_auto: get("MAG_AUTO")?,
            flux_auto: get("FLUX_AUTO")?,
            background: get("BACKGROUND")?,
            fwhm_image: get("FWHM_IMAGE")?,
            flags: get("FLAGS")? as i64,
            class_star: get("CLASS_STAR")?,
        })
    }
}
