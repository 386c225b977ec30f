//! Run-level error kinds.
//!
//! Configuration and data-sufficiency problems abort a run before any model is
//! fitted. Fit failures are normally caught per (model, fold) and recorded in
//! the results; they only surface here when a caller asks for a single fit.

use crate::data::DataError;
use crate::family::FitError;
use crate::output::OutputError;
use thiserror::Error;

/// Invalid run parameters, detected before any computation starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Fold count must be at least 2, got {0}.")]
    TooFewFolds(usize),

    #[error("Requested {folds} folds but only {subjects} subjects are available.")]
    FoldsExceedSubjects { folds: usize, subjects: usize },

    #[error(
        "Stratum '{label}' has {members} members, fewer than the {folds} requested folds. Use fewer folds or disable stratification."
    )]
    StratumTooSmall {
        label: String,
        members: usize,
        folds: usize,
    },

    #[error("Stratification by '{0}' was requested but the dataset has no such covariate column.")]
    MissingStratificationColumn(String),

    #[error("Unknown model family '{0}'. Expected one of: svm, rvm, gpr.")]
    UnknownModelFamily(String),

    #[error("No model families were requested.")]
    NoModels,

    #[error("Model name '{0}' is used by more than one model specification.")]
    DuplicateModelName(String),

    #[error(
        "Feature columns differ between cohorts: training cohort has {expected:?}, evaluation cohort has {found:?}."
    )]
    FeatureMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Invalid hyperparameter for model '{model}': {reason}")]
    InvalidHyperparameter { model: String, reason: String },

    #[error("Requested training size {size} exceeds the pool of {pool} subjects.")]
    SampleSizeExceedsPool { size: usize, pool: usize },

    #[error("At least one {0} is required.")]
    ZeroCount(&'static str),

    #[error("Models '{0}' and '{1}' cannot be compared: they were evaluated on different subjects.")]
    UnpairedPredictions(String, String),
}

/// The top-level error returned by every pipeline stage.
#[derive(Error, Debug)]
pub enum ComparisonError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(
        "Insufficient data for {context}: {found} subjects remain but at least {required} are required."
    )]
    InsufficientData {
        context: &'static str,
        found: usize,
        required: usize,
    },

    #[error("Model fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("Input error: {0}")]
    Input(#[from] DataError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),
}

impl ComparisonError {
    pub(crate) fn insufficient(context: &'static str, found: usize, required: usize) -> Self {
        Self::InsufficientData {
            context,
            found,
            required,
        }
    }
}
