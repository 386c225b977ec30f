//! Gaussian process regression with fixed covariance hyperparameters.
//!
//! The posterior mean is `m + k(x, X) (K + sigma^2 I)^-1 (y - m)` where `m` is
//! the training mean and `K` includes a constant bias term. Covariances that
//! are numerically singular (duplicated subjects, linear kernels with more
//! subjects than features) get escalating diagonal jitter before the fit is
//! declared a failure.

use super::{BIAS_VARIANCE, FitError, ModelFamily};
use crate::kernel::Kernel;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::{FactorizeC, SolveC, UPLO};
use serde::{Deserialize, Serialize};

/// Jitter of attempt `k` (k >= 1) is the mean kernel diagonal times
/// `FIRST_JITTER * JITTER_GROWTH^(k - 1)`.
const FIRST_JITTER: f64 = 1e-10;
const JITTER_GROWTH: f64 = 100.0;
/// Squared Cholesky pivots below this fraction of the mean diagonal are
/// treated as rank deficiency even when LAPACK accepts them.
const MIN_PIVOT_RATIO: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GprSpec {
    pub name: Option<String>,
    pub kernel: Kernel,
    /// Observation noise variance added to the kernel diagonal.
    pub noise_variance: f64,
    pub max_jitter_attempts: usize,
}

impl Default for GprSpec {
    fn default() -> Self {
        Self {
            name: None,
            kernel: Kernel::Linear,
            noise_variance: 1e-10,
            max_jitter_attempts: 5,
        }
    }
}

impl GprSpec {
    pub(super) fn validate(&self) -> Result<(), String> {
        if !(self.noise_variance >= 0.0 && self.noise_variance.is_finite()) {
            return Err(format!(
                "noise_variance must be non-negative, got {}",
                self.noise_variance
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GprModel {
    kernel: Kernel,
    training: Array2<f64>,
    weights: Array1<f64>,
    mean: f64,
    jitter: f64,
}

impl GprModel {
    /// Diagonal jitter that was needed on top of the noise variance.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub(super) fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let cross = self.kernel.gram(x, self.training.view()) + BIAS_VARIANCE;
        cross.dot(&self.weights) + self.mean
    }
}

pub(super) fn fit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    spec: &GprSpec,
) -> Result<GprModel, FitError> {
    let mean = y.mean().unwrap_or(0.0);
    let t = &y - mean;

    let mut covariance = spec.kernel.gram(x, x) + BIAS_VARIANCE;
    covariance.diag_mut().mapv_inplace(|v| v + spec.noise_variance);
    let mean_diagonal = covariance.diag().mean().unwrap_or(1.0).abs().max(f64::MIN_POSITIVE);

    let mut jitter = 0.0;
    for attempt in 0..=spec.max_jitter_attempts {
        if attempt > 0 {
            jitter = mean_diagonal * FIRST_JITTER * JITTER_GROWTH.powi(attempt as i32 - 1);
        }
        let mut attempt_covariance = covariance.clone();
        attempt_covariance.diag_mut().mapv_inplace(|v| v + jitter);

        match attempt_covariance.factorizec(UPLO::Lower) {
            Ok(factor)
                if factor
                    .factor
                    .diag()
                    .iter()
                    .any(|l| l * l < mean_diagonal * MIN_PIVOT_RATIO) =>
            {
                log::debug!("GPR covariance numerically singular with jitter {jitter:.3e}");
            }
            Ok(factor) => {
                let weights = factor.solvec(&t).map_err(|e| FitError::Linalg {
                    family: ModelFamily::Gpr,
                    message: e.to_string(),
                })?;
                if weights.iter().any(|w| !w.is_finite()) {
                    log::debug!("GPR weights non-finite with jitter {jitter:.3e}");
                    continue;
                }
                if jitter > 0.0 {
                    log::warn!("GPR covariance needed diagonal jitter {jitter:.3e} to factorise");
                }
                return Ok(GprModel {
                    kernel: spec.kernel,
                    training: x.to_owned(),
                    weights,
                    mean,
                    jitter,
                });
            }
            Err(e) => {
                log::debug!("GPR Cholesky failed with jitter {jitter:.3e}: {e}");
            }
        }
    }

    Err(FitError::NotPositiveDefinite {
        family: ModelFamily::Gpr,
        max_jitter: jitter,
    })
}
