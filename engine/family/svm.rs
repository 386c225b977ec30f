//! Epsilon-insensitive kernel support vector regression.
//!
//! The dual problem is solved by cyclic coordinate descent on
//! `beta_i = alpha_i - alpha_i*`, with the intercept absorbed into the kernel
//! (`k + BIAS_VARIANCE`) and targets centred on their training mean:
//!
//! ```text
//! min  1/2 beta' Q beta - t' beta + epsilon |beta|_1    s.t. |beta_i| <= C
//! ```
//!
//! When no `C` is given it is chosen by an inner K-fold grid search over the
//! training rows only, scored by mean absolute error.

use super::{BIAS_VARIANCE, FitError, ModelFamily};
use crate::folds::partition;
use crate::kernel::Kernel;
use crate::seeding::{SeedStream, task_seed};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Powers of two from 2^-7 to 2^7.
pub const DEFAULT_C_GRID: [f64; 9] = [
    0.0078125, 0.03125, 0.125, 0.5, 1.0, 2.0, 8.0, 32.0, 128.0,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmSpec {
    pub name: Option<String>,
    pub kernel: Kernel,
    /// Fixed regularisation strength. `None` selects it by grid search.
    pub c: Option<f64>,
    pub c_grid: Vec<f64>,
    pub inner_folds: usize,
    /// Half-width of the insensitive tube, in target units.
    pub epsilon: f64,
    pub tolerance: f64,
    /// Cap on coordinate-descent sweeps over the training set.
    pub max_iterations: usize,
}

impl Default for SvmSpec {
    fn default() -> Self {
        Self {
            name: None,
            kernel: Kernel::Linear,
            c: None,
            c_grid: DEFAULT_C_GRID.to_vec(),
            inner_folds: 5,
            epsilon: 0.1,
            tolerance: 1e-3,
            max_iterations: 10_000,
        }
    }
}

impl SvmSpec {
    pub(super) fn validate(&self) -> Result<(), String> {
        if let Some(c) = self.c {
            if !(c.is_finite() && c > 0.0) {
                return Err(format!("C must be positive, got {c}"));
            }
        } else {
            if self.c_grid.is_empty() {
                return Err("C grid is empty and no fixed C was given".to_string());
            }
            if self.c_grid.iter().any(|c| !(c.is_finite() && *c > 0.0)) {
                return Err("every C in the grid must be positive".to_string());
            }
            if self.inner_folds < 2 {
                return Err(format!("inner_folds must be at least 2, got {}", self.inner_folds));
            }
        }
        if !(self.epsilon >= 0.0 && self.epsilon.is_finite()) {
            return Err(format!("epsilon must be non-negative, got {}", self.epsilon));
        }
        if self.max_iterations == 0 || self.tolerance <= 0.0 {
            return Err("max_iterations and tolerance must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SvmModel {
    kernel: Kernel,
    support_vectors: Array2<f64>,
    dual_coefficients: Array1<f64>,
    intercept: f64,
    c: f64,
}

impl SvmModel {
    pub fn c(&self) -> f64 {
        self.c
    }

    pub fn num_support_vectors(&self) -> usize {
        self.dual_coefficients.len()
    }

    pub(super) fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let k = self.kernel.gram(x, self.support_vectors.view()) + BIAS_VARIANCE;
        k.dot(&self.dual_coefficients) + self.intercept
    }
}

pub(super) fn fit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    spec: &SvmSpec,
    seed: u64,
) -> Result<SvmModel, FitError> {
    let c = match spec.c {
        Some(c) => c,
        None => select_c(x, y, spec, seed)?,
    };
    fit_with_c(x, y, spec, c)
}

fn fit_with_c(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    spec: &SvmSpec,
    c: f64,
) -> Result<SvmModel, FitError> {
    let intercept = y.mean().unwrap_or(0.0);
    let t = &y - intercept;
    let q = spec.kernel.gram(x, x) + BIAS_VARIANCE;
    let beta = solve_dual(&q, t.view(), c, spec)?;

    let support: Vec<usize> = beta
        .iter()
        .enumerate()
        .filter(|(_, b)| b.abs() > 1e-12)
        .map(|(i, _)| i)
        .collect();
    log::debug!(
        "SVM fit with C={c}: {} of {} training subjects are support vectors",
        support.len(),
        x.nrows()
    );

    Ok(SvmModel {
        kernel: spec.kernel,
        support_vectors: x.select(Axis(0), &support),
        dual_coefficients: beta.select(Axis(0), &support),
        intercept,
        c,
    })
}

fn solve_dual(
    q: &Array2<f64>,
    t: ArrayView1<f64>,
    c: f64,
    spec: &SvmSpec,
) -> Result<Array1<f64>, FitError> {
    let n = t.len();
    let mut beta = Array1::<f64>::zeros(n);
    // gradient of the smooth part: Q beta - t
    let mut grad = t.mapv(|v| -v);
    let mut max_violation = f64::INFINITY;

    for _ in 0..spec.max_iterations {
        max_violation = 0.0;
        for i in 0..n {
            let qii = q[[i, i]];
            let z = beta[i] - grad[i] / qii;
            let threshold = spec.epsilon / qii;
            let shrunk = if z > threshold {
                z - threshold
            } else if z < -threshold {
                z + threshold
            } else {
                0.0
            };
            let updated = shrunk.clamp(-c, c);
            let delta = updated - beta[i];
            if delta != 0.0 {
                beta[i] = updated;
                grad.scaled_add(delta, &q.row(i));
            }
            max_violation = f64::max(max_violation, delta.abs() * qii);
        }
        if !max_violation.is_finite() {
            return Err(FitError::NonFiniteParameters {
                family: ModelFamily::Svm,
            });
        }
        if max_violation < spec.tolerance {
            return Ok(beta);
        }
    }

    Err(FitError::DidNotConverge {
        family: ModelFamily::Svm,
        iterations: spec.max_iterations,
        last_change: max_violation,
    })
}

/// Inner K-fold grid search over `spec.c_grid`, on the training rows only.
fn select_c(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    spec: &SvmSpec,
    seed: u64,
) -> Result<f64, FitError> {
    let empty_grid = || FitError::InvalidSpec {
        family: ModelFamily::Svm,
        reason: "C grid is empty and no fixed C was given".to_string(),
    };
    let n = x.nrows();
    let inner_folds = spec.inner_folds.min(n);
    if inner_folds < 2 {
        let fallback = *spec.c_grid.get(spec.c_grid.len() / 2).ok_or_else(empty_grid)?;
        log::warn!("Only {n} training subjects; skipping C search and using C={fallback}");
        return Ok(fallback);
    }
    let folds = partition(n, None, inner_folds, task_seed(seed, SeedStream::InnerSearch, 0))
        .map_err(|e| FitError::Linalg {
            family: ModelFamily::Svm,
            message: e.to_string(),
        })?;

    let mut best: Option<(f64, f64)> = None;
    let mut last_error = None;
    for &c in &spec.c_grid {
        let mut absolute_error = 0.0;
        let mut failed = false;
        for fold in 0..inner_folds {
            let train = folds.training(fold);
            let test = folds.held_out(fold);
            let x_train = x.select(Axis(0), &train);
            let y_train = y.select(Axis(0), &train);
            match fit_with_c(x_train.view(), y_train.view(), spec, c) {
                Ok(model) => {
                    let predicted = model.predict(x.select(Axis(0), &test).view());
                    absolute_error += test
                        .iter()
                        .zip(predicted.iter())
                        .map(|(&row, p)| (y[row] - p).abs())
                        .sum::<f64>();
                }
                Err(e) => {
                    log::debug!("C={c} failed in inner fold {fold}: {e}");
                    last_error = Some(e);
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            continue;
        }
        let mae = absolute_error / n as f64;
        // strict comparison keeps the smallest C on ties
        if best.is_none_or(|(_, best_mae)| mae < best_mae) {
            best = Some((c, mae));
        }
    }

    match (best, last_error) {
        (Some((c, mae)), _) => {
            log::debug!("Grid search selected C={c} (inner MAE {mae:.4})");
            Ok(c)
        }
        (None, Some(e)) => Err(e),
        (None, None) => Err(empty_grid()),
    }
}
