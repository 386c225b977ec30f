//! # Data Loading and Validation Module
//!
//! This module is the only entry point for user-provided tables. It reads a
//! feature table (TSV or CSV), validates it column by column and turns it into
//! the [`Dataset`] consumed by every pipeline stage.
//!
//! - Fixed roles, flexible features: the subject identifier, target, sex and
//!   site columns have well-known names (configurable through [`LoadOptions`]);
//!   every other column is a feature unless an explicit feature list is given.
//! - User-centric errors: failures are assumed to be input errors, and
//!   [`DataError`] says which column or subject is at fault.
//! - Cleaning and quality control happen upstream. Anything that is not a
//!   complete, finite numeric table is rejected rather than repaired.

use crate::error::ConfigurationError;
use ahash::AHashSet;
use ndarray::{Array1, Array2, Axis, ShapeBuilder};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const MINIMUM_ROWS: usize = 10;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("Subject identifier '{0}' appears more than once.")]
    DuplicateSubject(String),
    #[error("No feature columns were found after removing identifier, target and covariate columns.")]
    NoFeatures,
    #[error(
        "Inconsistent dataset shape: {subjects} subject identifiers, {feature_rows} feature rows, {targets} targets."
    )]
    ShapeMismatch {
        subjects: usize,
        feature_rows: usize,
        targets: usize,
    },
    #[error("The normalisation column '{0}' contains zero values.")]
    ZeroNormaliser(String),
    #[error("The subject list '{0}' contains no identifiers.")]
    EmptySubjectList(String),
}

/// Covariates that may be used as stratification labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StratifyBy {
    Sex,
    Site,
}

impl std::fmt::Display for StratifyBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sex => "sex",
            Self::Site => "site",
        })
    }
}

/// An ordered cohort of subjects with a shared feature layout.
///
/// Invariants enforced at construction: identifiers are unique, every subject
/// has `feature_names.len()` finite features and a finite target, and the
/// optional covariates have one entry per subject.
#[derive(Debug, Clone)]
pub struct Dataset {
    ids: Vec<String>,
    features: Array2<f64>,
    targets: Array1<f64>,
    sex: Option<Vec<String>>,
    site: Option<Vec<String>>,
    feature_names: Vec<String>,
}

impl Dataset {
    pub fn new(
        ids: Vec<String>,
        features: Array2<f64>,
        targets: Array1<f64>,
        feature_names: Vec<String>,
    ) -> Result<Self, DataError> {
        if ids.len() != features.nrows() || ids.len() != targets.len() {
            return Err(DataError::ShapeMismatch {
                subjects: ids.len(),
                feature_rows: features.nrows(),
                targets: targets.len(),
            });
        }
        if features.ncols() == 0 || features.ncols() != feature_names.len() {
            return Err(DataError::NoFeatures);
        }
        let mut seen = AHashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(DataError::DuplicateSubject(id.clone()));
            }
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound("features".to_string()));
        }
        if targets.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound("target".to_string()));
        }
        Ok(Self {
            ids,
            features,
            targets,
            sex: None,
            site: None,
            feature_names,
        })
    }

    pub fn with_sex(mut self, sex: Vec<String>) -> Result<Self, DataError> {
        self.check_covariate_len(sex.len())?;
        self.sex = Some(sex);
        Ok(self)
    }

    pub fn with_site(mut self, site: Vec<String>) -> Result<Self, DataError> {
        self.check_covariate_len(site.len())?;
        self.site = Some(site);
        Ok(self)
    }

    fn check_covariate_len(&self, len: usize) -> Result<(), DataError> {
        if len != self.ids.len() {
            return Err(DataError::ShapeMismatch {
                subjects: self.ids.len(),
                feature_rows: len,
                targets: self.targets.len(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn targets(&self) -> &Array1<f64> {
        &self.targets
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn sex(&self) -> Option<&[String]> {
        self.sex.as_deref()
    }

    pub fn site(&self) -> Option<&[String]> {
        self.site.as_deref()
    }

    /// Returns a new dataset holding the given rows, in the given order.
    pub fn subset(&self, rows: &[usize]) -> Dataset {
        let pick = |values: &Option<Vec<String>>| {
            values
                .as_ref()
                .map(|v| rows.iter().map(|&i| v[i].clone()).collect::<Vec<_>>())
        };
        Dataset {
            ids: rows.iter().map(|&i| self.ids[i].clone()).collect(),
            features: self.features.select(Axis(0), rows),
            targets: self.targets.select(Axis(0), rows),
            sex: pick(&self.sex),
            site: pick(&self.site),
            feature_names: self.feature_names.clone(),
        }
    }

    /// Keeps only the subjects named in `keep`, preserving dataset order.
    pub fn filter_ids(&self, keep: &AHashSet<String>) -> Dataset {
        let rows: Vec<usize> = self
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| keep.contains(id.as_str()))
            .map(|(i, _)| i)
            .collect();
        if rows.len() < keep.len() {
            log::warn!(
                "{} of {} listed subjects are not present in the dataset.",
                keep.len() - rows.len(),
                keep.len()
            );
        }
        self.subset(&rows)
    }

    /// Keeps only the subjects acquired at `site`. A dataset without a site
    /// column is returned unchanged.
    pub fn filter_site(&self, site: &str) -> Dataset {
        match &self.site {
            Some(sites) => {
                let rows: Vec<usize> = sites
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.as_str() == site)
                    .map(|(i, _)| i)
                    .collect();
                log::info!(
                    "Site filter '{site}' kept {} of {} subjects.",
                    rows.len(),
                    self.len()
                );
                self.subset(&rows)
            }
            None => {
                log::warn!("No site column present; site filter '{site}' ignored.");
                self.clone()
            }
        }
    }

    /// Replaces the target vector, keeping everything else.
    pub fn with_targets(&self, targets: Array1<f64>) -> Dataset {
        debug_assert_eq!(targets.len(), self.len(), "target length must match subject count");
        Dataset {
            targets,
            ..self.clone()
        }
    }

    pub fn stratification_labels(&self, by: StratifyBy) -> Result<&[String], ConfigurationError> {
        let labels = match by {
            StratifyBy::Sex => self.sex.as_deref(),
            StratifyBy::Site => self.site.as_deref(),
        };
        labels.ok_or_else(|| ConfigurationError::MissingStratificationColumn(by.to_string()))
    }

    /// Checks that a model trained on `self` can be applied to `other`.
    pub fn ensure_compatible(&self, other: &Dataset) -> Result<(), ConfigurationError> {
        if self.feature_names != other.feature_names {
            return Err(ConfigurationError::FeatureMismatch {
                expected: self.feature_names.clone(),
                found: other.feature_names.clone(),
            });
        }
        Ok(())
    }
}

/// Column roles and optional preprocessing for [`load_dataset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    pub id_column: String,
    pub target_column: String,
    pub sex_column: String,
    pub site_column: String,
    /// Divide every feature by this column (e.g. total intracranial volume).
    pub normalize_by: Option<String>,
    /// Explicit feature list. When empty, every non-role column is a feature.
    pub feature_columns: Vec<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            id_column: "subject_id".to_string(),
            target_column: "age".to_string(),
            sex_column: "sex".to_string(),
            site_column: "site".to_string(),
            normalize_by: None,
            feature_columns: Vec::new(),
        }
    }
}

/// Loads and validates a feature table.
pub fn load_dataset(path: &Path, options: &LoadOptions) -> Result<Dataset, DataError> {
    let separator = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };

    log::info!("Loading data from '{}'", path.display());
    let text_schema = text_columns(path, separator, options)?;
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_schema_overwrite(Some(Arc::new(text_schema)))
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if df.height() < MINIMUM_ROWS {
        return Err(DataError::InsufficientRows {
            found: df.height(),
            required: MINIMUM_ROWS,
        });
    }

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let has = |name: &str| columns.iter().any(|c| c == name);

    for required in [&options.id_column, &options.target_column] {
        if !has(required) {
            return Err(DataError::ColumnNotFound(required.clone()));
        }
    }

    let feature_names: Vec<String> = if options.feature_columns.is_empty() {
        let reserved = [
            Some(options.id_column.as_str()),
            Some(options.target_column.as_str()),
            Some(options.sex_column.as_str()),
            Some(options.site_column.as_str()),
            options.normalize_by.as_deref(),
        ];
        columns
            .iter()
            .filter(|c| !reserved.contains(&Some(c.as_str())))
            .cloned()
            .collect()
    } else {
        for name in &options.feature_columns {
            if !has(name) {
                return Err(DataError::ColumnNotFound(name.clone()));
            }
        }
        options.feature_columns.clone()
    };
    if feature_names.is_empty() {
        return Err(DataError::NoFeatures);
    }

    let n = df.height();
    let ids = extract_string_column(&df, &options.id_column)?;
    let targets = Array1::from_vec(extract_numeric_column(&df, &options.target_column)?);

    let mut buffer = Vec::with_capacity(n * feature_names.len());
    for name in &feature_names {
        buffer.append(&mut extract_numeric_column(&df, name)?);
    }
    let mut features = Array2::from_shape_vec((n, feature_names.len()).f(), buffer)
        .map_err(|_| DataError::ShapeMismatch {
            subjects: n,
            feature_rows: n,
            targets: targets.len(),
        })?
        .as_standard_layout()
        .into_owned();

    if let Some(normaliser) = &options.normalize_by {
        if !has(normaliser) {
            return Err(DataError::ColumnNotFound(normaliser.clone()));
        }
        let divisor = extract_numeric_column(&df, normaliser)?;
        if divisor.iter().any(|&d| d == 0.0) {
            return Err(DataError::ZeroNormaliser(normaliser.clone()));
        }
        for (mut row, d) in features.rows_mut().into_iter().zip(divisor) {
            row.mapv_inplace(|v| v / d);
        }
        log::info!("Features normalised by column '{normaliser}'.");
    }

    let mut dataset = Dataset::new(ids, features, targets, feature_names)?;
    if has(&options.sex_column) {
        dataset = dataset.with_sex(extract_string_column(&df, &options.sex_column)?)?;
    }
    if has(&options.site_column) {
        dataset = dataset.with_site(extract_string_column(&df, &options.site_column)?)?;
    }

    log::info!(
        "Loaded {} subjects with {} features.",
        dataset.len(),
        dataset.num_features()
    );
    Ok(dataset)
}

/// Reads a subject-inclusion list: one identifier per line. Blank lines,
/// `#` comments and a leading `subject_id`/`image_id` header are skipped.
pub fn load_subject_list(path: &Path) -> Result<AHashSet<String>, DataError> {
    let text = fs::read_to_string(path)?;
    let mut ids = AHashSet::new();
    for (line_no, line) in text.lines().enumerate() {
        let id = line.split([',', '\t']).next().unwrap_or("").trim();
        if id.is_empty() || id.starts_with('#') {
            continue;
        }
        if line_no == 0
            && (id.eq_ignore_ascii_case("subject_id") || id.eq_ignore_ascii_case("image_id"))
        {
            continue;
        }
        ids.insert(id.to_string());
    }
    if ids.is_empty() {
        return Err(DataError::EmptySubjectList(path.display().to_string()));
    }
    Ok(ids)
}

/// Role columns present in the header, typed as text so that identifiers
/// such as `001` keep their leading zeros.
fn text_columns(path: &Path, separator: u8, options: &LoadOptions) -> Result<Schema, DataError> {
    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    let present: AHashSet<&str> = header
        .trim_end_matches(['\r', '\n'])
        .split(char::from(separator))
        .map(|name| name.trim().trim_matches('"'))
        .collect();
    Ok([&options.id_column, &options.sex_column, &options.site_column]
        .into_iter()
        .filter(|name| present.contains(name.as_str()))
        .map(|name| Field::new(name.as_str().into(), DataType::String))
        .collect())
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_string_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let column = df.column(column_name)?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    let chunked = casted.as_materialized_series().str()?;
    chunked
        .into_iter()
        .map(|value| match value {
            Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            _ => Err(DataError::MissingValuesFound(column_name.to_string())),
        })
        .collect()
}
