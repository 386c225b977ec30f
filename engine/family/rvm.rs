//! Relevance vector regression (sparse Bayesian learning).
//!
//! Basis functions are a constant column plus one kernel column per training
//! subject. Each weight has its own precision `alpha_i`; the noise precision is
//! `beta`. Iterations alternate the Gaussian posterior over weights with the
//! re-estimation updates
//!
//! ```text
//! gamma_i = 1 - alpha_i * Sigma_ii
//! alpha_i = gamma_i / mu_i^2
//! beta    = (n - sum(gamma)) / |t - Phi mu|^2
//! ```
//!
//! Basis functions whose precision passes `prune_threshold` are dropped. The
//! loop stops when the in-sample fit stops moving; hitting the iteration cap
//! is a fit failure rather than a silently unconverged model.

use super::{FitError, ModelFamily};
use crate::kernel::Kernel;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{FactorizeC, InverseC, UPLO};
use serde::{Deserialize, Serialize};

const MAX_NOISE_PRECISION: f64 = 1e12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RvmSpec {
    pub name: Option<String>,
    pub kernel: Kernel,
    pub max_iterations: usize,
    /// Largest change of the in-sample fit, relative to the target spread,
    /// that still counts as converged.
    pub tolerance: f64,
    pub prune_threshold: f64,
}

impl Default for RvmSpec {
    fn default() -> Self {
        Self {
            name: None,
            kernel: Kernel::Linear,
            max_iterations: 1000,
            tolerance: 1e-4,
            prune_threshold: 1e9,
        }
    }
}

impl RvmSpec {
    pub(super) fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".to_string());
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(format!("tolerance must be positive, got {}", self.tolerance));
        }
        if !(self.prune_threshold > 1.0) {
            return Err(format!(
                "prune_threshold must exceed 1, got {}",
                self.prune_threshold
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RvmModel {
    kernel: Kernel,
    relevance_vectors: Array2<f64>,
    weights: Array1<f64>,
    bias: f64,
    noise_precision: f64,
    iterations: usize,
}

impl RvmModel {
    pub fn num_relevance_vectors(&self) -> usize {
        self.weights.len()
    }

    pub fn noise_variance(&self) -> f64 {
        1.0 / self.noise_precision
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub(super) fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        if self.weights.is_empty() {
            return Array1::from_elem(x.nrows(), self.bias);
        }
        self.kernel
            .gram(x, self.relevance_vectors.view())
            .dot(&self.weights)
            + self.bias
    }
}

pub(super) fn fit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    spec: &RvmSpec,
) -> Result<RvmModel, FitError> {
    let n = x.nrows();
    let linalg = |e: ndarray_linalg::error::LinalgError| FitError::Linalg {
        family: ModelFamily::Rvm,
        message: e.to_string(),
    };

    let offset = y.mean().unwrap_or(0.0);
    let t = &y - offset;
    let spread = t.mapv(|v| v * v).mean().unwrap_or(0.0).sqrt().max(f64::EPSILON);

    let mut phi = Array2::<f64>::ones((n, n + 1));
    phi.slice_mut(s![.., 1..]).assign(&spec.kernel.gram(x, x));
    let phi_t_phi = phi.t().dot(&phi);
    let phi_t_t = phi.t().dot(&t);

    let mut alpha = Array1::<f64>::ones(n + 1);
    let mut beta = (1.0 / (0.1 * spread * spread)).min(MAX_NOISE_PRECISION);
    // Column 0 is the constant basis and is never pruned.
    let mut active: Vec<usize> = (0..=n).collect();
    let mut previous_fit: Option<Array1<f64>> = None;
    let mut last_change = f64::INFINITY;

    for iteration in 1..=spec.max_iterations {
        let mut h = phi_t_phi.select(Axis(0), &active).select(Axis(1), &active) * beta;
        for (position, &basis) in active.iter().enumerate() {
            h[[position, position]] += alpha[basis];
        }
        let sigma = h.factorizec(UPLO::Lower).map_err(linalg)?.invc().map_err(linalg)?;
        let mu = sigma.dot(&phi_t_t.select(Axis(0), &active)) * beta;
        if mu.iter().any(|m| !m.is_finite()) {
            return Err(FitError::NonFiniteParameters {
                family: ModelFamily::Rvm,
            });
        }

        let fitted = phi.select(Axis(1), &active).dot(&mu);
        let residual_ss = (&t - &fitted).mapv(|r| r * r).sum();

        if let Some(previous) = &previous_fit {
            last_change = (&fitted - previous)
                .iter()
                .fold(0.0_f64, |acc, d| acc.max(d.abs()))
                / spread;
            if last_change < spec.tolerance {
                log::debug!(
                    "RVM converged after {iteration} iterations with {} relevance vectors",
                    active.len() - 1
                );
                let vectors: Vec<usize> = active[1..].iter().map(|&basis| basis - 1).collect();
                return Ok(RvmModel {
                    kernel: spec.kernel,
                    relevance_vectors: x.select(Axis(0), &vectors),
                    weights: mu.slice(s![1..]).to_owned(),
                    bias: offset + mu[0],
                    noise_precision: beta,
                    iterations: iteration,
                });
            }
        }
        previous_fit = Some(fitted);

        let mut well_determined = 0.0;
        for (position, &basis) in active.iter().enumerate() {
            let gamma = (1.0 - alpha[basis] * sigma[[position, position]]).clamp(0.0, 1.0);
            well_determined += gamma;
            let weight_sq = mu[position] * mu[position];
            alpha[basis] = if weight_sq > 0.0 {
                (gamma / weight_sq).min(f64::MAX)
            } else {
                f64::INFINITY
            };
        }
        beta = ((n as f64 - well_determined).max(f64::EPSILON)
            / residual_ss.max(f64::MIN_POSITIVE))
        .min(MAX_NOISE_PRECISION);

        active.retain(|&basis| basis == 0 || alpha[basis] < spec.prune_threshold);
        // The constant basis cannot be pruned, but its precision is kept finite.
        alpha[0] = alpha[0].min(spec.prune_threshold);
    }

    Err(FitError::DidNotConverge {
        family: ModelFamily::Rvm,
        iterations: spec.max_iterations,
        last_change,
    })
}
