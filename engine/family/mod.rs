//! # Model Families
//!
//! One interface over every regression family the comparison runs. A
//! [`ModelSpec`] names a family and its hyperparameters; [`fit`] turns it into
//! an immutable [`TrainedModel`] that owns everything needed for prediction,
//! including the feature scaler fitted on the training rows.
//!
//! Adding a family means adding a variant to [`ModelSpec`] and
//! [`FittedRegressor`]; the cross-validation, generalization, permutation and
//! sample-size stages only ever see this module's types.

pub mod gpr;
pub mod rvm;
pub mod svm;

use crate::error::ConfigurationError;
use crate::kernel::Kernel;
use crate::scaler::RobustScaler;
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use gpr::{GprModel, GprSpec};
pub use rvm::{RvmModel, RvmSpec};
pub use svm::{SvmModel, SvmSpec};

/// Constant added to kernels of families without an explicit bias term; it
/// plays the role of a prior variance on the intercept.
pub(crate) const BIAS_VARIANCE: f64 = 1.0;

/// Errors raised while fitting one model instance on one training set.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Cannot fit {family} on an empty training set.")]
    EmptyTrainingSet { family: ModelFamily },

    #[error("Invalid {family} specification: {reason}")]
    InvalidSpec { family: ModelFamily, reason: String },

    #[error("{family} did not converge within {iterations} iterations (last change {last_change:.3e}).")]
    DidNotConverge {
        family: ModelFamily,
        iterations: usize,
        last_change: f64,
    },

    #[error(
        "{family} covariance matrix is not positive definite even after adding diagonal jitter up to {max_jitter:.3e}."
    )]
    NotPositiveDefinite { family: ModelFamily, max_jitter: f64 },

    #[error("{family} linear algebra failure: {message}")]
    Linalg { family: ModelFamily, message: String },

    #[error("{family} produced non-finite fitted parameters.")]
    NonFiniteParameters { family: ModelFamily },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Svm,
    Rvm,
    Gpr,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [Self::Svm, Self::Rvm, Self::Gpr];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Svm => "SVM",
            Self::Rvm => "RVM",
            Self::Gpr => "GPR",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "svm" | "svr" => Ok(Self::Svm),
            "rvm" | "rvr" => Ok(Self::Rvm),
            "gpr" | "gp" => Ok(Self::Gpr),
            _ => Err(ConfigurationError::UnknownModelFamily(s.to_string())),
        }
    }
}

/// A model family plus its hyperparameters. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ModelSpec {
    Svm(SvmSpec),
    Rvm(RvmSpec),
    Gpr(GprSpec),
}

impl ModelSpec {
    /// The default configuration of `family`, with a linear kernel.
    pub fn defaults(family: ModelFamily) -> Self {
        match family {
            ModelFamily::Svm => Self::Svm(SvmSpec::default()),
            ModelFamily::Rvm => Self::Rvm(RvmSpec::default()),
            ModelFamily::Gpr => Self::Gpr(GprSpec::default()),
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Svm(_) => ModelFamily::Svm,
            Self::Rvm(_) => ModelFamily::Rvm,
            Self::Gpr(_) => ModelFamily::Gpr,
        }
    }

    pub fn kernel(&self) -> Kernel {
        match self {
            Self::Svm(spec) => spec.kernel,
            Self::Rvm(spec) => spec.kernel,
            Self::Gpr(spec) => spec.kernel,
        }
    }

    /// Display name used in every result table. Defaults to the family name.
    pub fn name(&self) -> String {
        let label = match self {
            Self::Svm(spec) => spec.name.as_deref(),
            Self::Rvm(spec) => spec.name.as_deref(),
            Self::Gpr(spec) => spec.name.as_deref(),
        };
        label.map_or_else(|| self.family().to_string(), str::to_string)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidHyperparameter {
            model: self.name(),
            reason,
        };
        self.kernel().validate().map_err(invalid)?;
        match self {
            Self::Svm(spec) => spec.validate().map_err(invalid),
            Self::Rvm(spec) => spec.validate().map_err(invalid),
            Self::Gpr(spec) => spec.validate().map_err(invalid),
        }
    }
}

/// Checks a list of model specifications before a run starts.
pub fn validate_specs(specs: &[ModelSpec]) -> Result<(), ConfigurationError> {
    if specs.is_empty() {
        return Err(ConfigurationError::NoModels);
    }
    let mut names = std::collections::BTreeSet::new();
    for spec in specs {
        spec.validate()?;
        let name = spec.name();
        if !names.insert(name.clone()) {
            return Err(ConfigurationError::DuplicateModelName(name));
        }
    }
    Ok(())
}

/// Fitted parameters of one family.
#[derive(Debug, Clone)]
pub enum FittedRegressor {
    Svm(SvmModel),
    Rvm(RvmModel),
    Gpr(GprModel),
}

impl FittedRegressor {
    fn predict_scaled(&self, x: ArrayView2<f64>) -> Array1<f64> {
        match self {
            Self::Svm(model) => model.predict(x),
            Self::Rvm(model) => model.predict(x),
            Self::Gpr(model) => model.predict(x),
        }
    }
}

impl fmt::Display for FittedRegressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Svm(model) => write!(
                f,
                "C={}, {} support vectors",
                model.c(),
                model.num_support_vectors()
            ),
            Self::Rvm(model) => write!(
                f,
                "{} relevance vectors, noise variance {:.3e}, {} iterations",
                model.num_relevance_vectors(),
                model.noise_variance(),
                model.iterations()
            ),
            Self::Gpr(model) => write!(f, "diagonal jitter {:.1e}", model.jitter()),
        }
    }
}

/// A model fitted on one training set. Prediction is pure.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    name: String,
    scaler: RobustScaler,
    regressor: FittedRegressor,
}

impl TrainedModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn regressor(&self) -> &FittedRegressor {
        &self.regressor
    }

    pub fn num_features(&self) -> usize {
        self.scaler.num_features()
    }

    /// Predicts one target per row of `x` (raw, unscaled features).
    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let scaled = self.scaler.transform(x);
        self.regressor.predict_scaled(scaled.view())
    }

    pub fn predict_one(&self, features: ArrayView1<f64>) -> f64 {
        let scaled = self.scaler.transform_row(features);
        let row = scaled.view().insert_axis(ndarray::Axis(0));
        self.regressor.predict_scaled(row)[0]
    }
}

/// Fits `spec` on raw features `x` and targets `y`.
///
/// `seed` drives any internal resampling (the SVM's inner grid search), so a
/// fit is reproducible from its inputs alone.
pub fn fit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    spec: &ModelSpec,
    seed: u64,
) -> Result<TrainedModel, FitError> {
    if x.nrows() == 0 {
        return Err(FitError::EmptyTrainingSet {
            family: spec.family(),
        });
    }
    spec.validate().map_err(|e| FitError::InvalidSpec {
        family: spec.family(),
        reason: e.to_string(),
    })?;
    let scaler = RobustScaler::fit(x);
    let scaled = scaler.transform(x);

    let regressor = match spec {
        ModelSpec::Svm(svm_spec) => {
            FittedRegressor::Svm(svm::fit(scaled.view(), y, svm_spec, seed)?)
        }
        ModelSpec::Rvm(rvm_spec) => FittedRegressor::Rvm(rvm::fit(scaled.view(), y, rvm_spec)?),
        ModelSpec::Gpr(gpr_spec) => FittedRegressor::Gpr(gpr::fit(scaled.view(), y, gpr_spec)?),
    };

    Ok(TrainedModel {
        name: spec.name(),
        scaler,
        regressor,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use ndarray::{Array1, Array2};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    /// `y = 40 + 3 x0 - 2 x1 + noise`, other features are pure noise.
    pub fn linear_problem(n: usize, p: usize, noise: f64, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let x = Array2::from_shape_fn((n, p), |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(n, |i| {
            40.0 + 3.0 * x[[i, 0]] - 2.0 * x[[i, 1]] + noise * normal.sample(&mut rng)
        });
        (x, y)
    }

    pub fn r2(truth: &Array1<f64>, predicted: &Array1<f64>) -> f64 {
        let mean = truth.mean().unwrap();
        let ss_res: f64 = truth.iter().zip(predicted).map(|(t, p)| (t - p).powi(2)).sum();
        let ss_tot: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
        1.0 - ss_res / ss_tot
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{linear_problem, r2};
    use super::*;
    use ndarray::s;

    #[test]
    fn family_names_parse_case_insensitively() {
        assert_eq!("SVM".parse::<ModelFamily>().unwrap(), ModelFamily::Svm);
        assert_eq!("gp".parse::<ModelFamily>().unwrap(), ModelFamily::Gpr);
        assert_eq!(
            "forest".parse::<ModelFamily>(),
            Err(ConfigurationError::UnknownModelFamily("forest".to_string()))
        );
    }

    #[test]
    fn every_family_fits_a_linear_signal() {
        let (x, y) = linear_problem(60, 4, 0.1, 1);
        let (x_train, y_train) = (x.slice(s![..45, ..]), y.slice(s![..45]));
        let (x_test, y_test) = (x.slice(s![45.., ..]), y.slice(s![45..]).to_owned());
        for family in ModelFamily::ALL {
            let spec = match family {
                ModelFamily::Svm => ModelSpec::Svm(SvmSpec {
                    c: Some(10.0),
                    ..SvmSpec::default()
                }),
                other => ModelSpec::defaults(other),
            };
            let model = fit(x_train, y_train, &spec, 7).unwrap();
            let predicted = model.predict(x_test);
            let score = r2(&y_test, &predicted);
            assert!(score > 0.9, "{family}: R2 = {score}");
            let single = model.predict_one(x_test.row(0));
            assert!((single - predicted[0]).abs() < 1e-9);
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let specs = vec![
            ModelSpec::defaults(ModelFamily::Gpr),
            ModelSpec::defaults(ModelFamily::Gpr),
        ];
        assert_eq!(
            validate_specs(&specs),
            Err(ConfigurationError::DuplicateModelName("GPR".to_string()))
        );
        assert_eq!(validate_specs(&[]), Err(ConfigurationError::NoModels));
    }

    #[test]
    fn empty_training_set_is_a_fit_error() {
        let x = ndarray::Array2::<f64>::zeros((0, 3));
        let y = ndarray::Array1::<f64>::zeros(0);
        let err = fit(x.view(), y.view(), &ModelSpec::defaults(ModelFamily::Rvm), 0).unwrap_err();
        assert_eq!(err, FitError::EmptyTrainingSet { family: ModelFamily::Rvm });
    }

    #[test]
    fn fitted_regressors_describe_themselves() {
        let (x, y) = linear_problem(30, 3, 0.1, 3);
        let expected = [
            (ModelFamily::Svm, "support vectors"),
            (ModelFamily::Rvm, "relevance vectors"),
            (ModelFamily::Gpr, "jitter"),
        ];
        for (family, phrase) in expected {
            let spec = match family {
                ModelFamily::Svm => ModelSpec::Svm(SvmSpec {
                    c: Some(1.0),
                    ..SvmSpec::default()
                }),
                other => ModelSpec::defaults(other),
            };
            let model = fit(x.view(), y.view(), &spec, 1).unwrap();
            let text = model.regressor().to_string();
            assert!(text.contains(phrase), "{family}: {text}");
        }
    }

    #[test]
    fn invalid_spec_is_a_fit_error_not_a_panic() {
        let (x, y) = linear_problem(20, 3, 0.1, 2);
        let spec = ModelSpec::Svm(SvmSpec {
            c_grid: Vec::new(),
            ..SvmSpec::default()
        });
        let err = fit(x.view(), y.view(), &spec, 0).unwrap_err();
        match &err {
            FitError::InvalidSpec { family, reason } => {
                assert_eq!(*family, ModelFamily::Svm);
                assert!(reason.contains("C grid"), "{reason}");
            }
            other => panic!("Expected InvalidSpec, got {other:?}"),
        }
    }
}
