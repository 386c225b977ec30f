//! Robust feature scaling (median centring, inter-quartile range scaling).
//!
//! Fitted on a training fold only and carried inside the trained model, so
//! held-out folds and external cohorts are transformed with the training
//! statistics.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustScaler {
    center: Array1<f64>,
    scale: Array1<f64>,
}

impl RobustScaler {
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let mut center = Array1::zeros(x.ncols());
        let mut scale = Array1::ones(x.ncols());
        for (j, column) in x.axis_iter(Axis(1)).enumerate() {
            let mut sorted: Vec<f64> = column.to_vec();
            sorted.sort_by(f64::total_cmp);
            center[j] = quantile(&sorted, 0.5);
            let iqr = quantile(&sorted, 0.75) - quantile(&sorted, 0.25);
            // Constant columns keep unit scale.
            if iqr > f64::EPSILON * center[j].abs().max(1.0) {
                scale[j] = iqr;
            }
        }
        Self { center, scale }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        (&x - &self.center) / &self.scale
    }

    pub fn transform_row(&self, x: ArrayView1<f64>) -> Array1<f64> {
        (&x - &self.center) / &self.scale
    }

    pub fn num_features(&self) -> usize {
        self.center.len()
    }
}

/// Linear-interpolation quantile of an ascending slice.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let fraction = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}
