//! Experiment files.
//!
//! A TOML file can describe the models and every stage's settings at once.
//! Missing sections fall back to their defaults, and command-line flags
//! override whatever the file says.
//!
//! ```toml
//! [load]
//! normalize_by = "tiv"
//!
//! [[models]]
//! family = "svm"
//! c = 1.0
//!
//! [[models]]
//! family = "gpr"
//! name = "GPR-rbf"
//! kernel = { type = "rbf", gamma = 0.01 }
//!
//! [cross_validation]
//! folds = 10
//! repetitions = 10
//! ```

use crate::cv::CvPlan;
use crate::data::LoadOptions;
use crate::family::{ModelFamily, ModelSpec};
use crate::permutation::PermutationPlan;
use crate::sample_size::SampleSizePlan;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read experiment file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML experiment file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize experiment to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub load: LoadOptions,
    /// Empty means every family with its default hyperparameters.
    pub models: Vec<ModelSpec>,
    pub cross_validation: CvPlan,
    pub permutation: PermutationPlan,
    pub sample_size: SampleSizePlan,
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The configured models, or the defaults of every family.
    pub fn model_specs(&self) -> Vec<ModelSpec> {
        if self.models.is_empty() {
            ModelFamily::ALL.into_iter().map(ModelSpec::defaults).collect()
        } else {
            self.models.clone()
        }
    }
}
