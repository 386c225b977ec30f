//! # Regression Metrics
//!
//! Everything here is recomputed from stored predictions: per-fold results are
//! the only source of truth, and pooled or summarised numbers are derived from
//! them on demand. Undefined quantities (the correlation of a constant
//! prediction, R² of a constant target) are `NaN`, never a made-up value.

use crate::family::FitError;
use ahash::AHashMap;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use std::collections::BTreeMap;

/// Accuracy of one set of predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionMetrics {
    pub n: usize,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub pearson: f64,
    /// Spearman correlation between the absolute error and the true target.
    pub age_error_corr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Mae,
    Rmse,
    R2,
    Pearson,
    AgeErrorCorr,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Self::Mae,
        Self::Rmse,
        Self::R2,
        Self::Pearson,
        Self::AgeErrorCorr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mae => "mae",
            Self::Rmse => "rmse",
            Self::R2 => "r2",
            Self::Pearson => "pearson",
            Self::AgeErrorCorr => "age_error_corr",
        }
    }
}

impl RegressionMetrics {
    pub fn compute(truth: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Self {
        debug_assert_eq!(truth.len(), predicted.len());
        let n = truth.len();
        if n == 0 {
            return Self {
                n,
                mae: f64::NAN,
                rmse: f64::NAN,
                r2: f64::NAN,
                pearson: f64::NAN,
                age_error_corr: f64::NAN,
            };
        }
        let errors = &predicted - &truth;
        let mae = errors.mapv(f64::abs).sum() / n as f64;
        let ss_res = errors.mapv(|e| e * e).sum();
        let rmse = (ss_res / n as f64).sqrt();

        let mean = truth.sum() / n as f64;
        let ss_tot = truth.mapv(|t| (t - mean) * (t - mean)).sum();
        let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN };

        let absolute = errors.mapv(f64::abs);
        Self {
            n,
            mae,
            rmse,
            r2,
            pearson: pearson(truth, predicted),
            age_error_corr: spearman(absolute.view(), truth),
        }
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Mae => self.mae,
            Metric::Rmse => self.rmse,
            Metric::R2 => self.r2,
            Metric::Pearson => self.pearson,
            Metric::AgeErrorCorr => self.age_error_corr,
        }
    }
}

/// Pearson correlation; `NaN` when either side has zero variance.
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean_a = a.sum() / n as f64;
    let mean_b = b.sum() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return f64::NAN;
    }
    cov / (var_a * var_b).sqrt()
}

/// Spearman rank correlation with average ranks for ties.
pub fn spearman(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    pearson(ranks(a).view(), ranks(b).view())
}

fn ranks(values: ArrayView1<f64>) -> Array1<f64> {
    let order: Vec<usize> = (0..values.len())
        .sorted_by(|&i, &j| values[i].total_cmp(&values[j]))
        .collect();
    let mut ranks = Array1::zeros(values.len());
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // 1-based average rank of the tie block [start, end)
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

/// Held-out predictions for a set of subjects, aligned by position.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    pub subject_ids: Vec<String>,
    pub true_targets: Array1<f64>,
    pub predicted: Array1<f64>,
    /// `predicted - true`, the brain-age gap.
    pub residuals: Array1<f64>,
}

impl Predictions {
    pub fn new(
        subject_ids: Vec<String>,
        true_targets: Array1<f64>,
        predicted: Array1<f64>,
    ) -> Self {
        debug_assert_eq!(subject_ids.len(), true_targets.len());
        debug_assert_eq!(subject_ids.len(), predicted.len());
        let residuals = &predicted - &true_targets;
        Self {
            subject_ids,
            true_targets,
            predicted,
            residuals,
        }
    }

    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    pub fn metrics(&self) -> RegressionMetrics {
        RegressionMetrics::compute(self.true_targets.view(), self.predicted.view())
    }

    /// Concatenates prediction sets in iteration order.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Predictions>) -> Predictions {
        let mut ids = Vec::new();
        let mut truth = Vec::new();
        let mut predicted = Vec::new();
        for part in parts {
            ids.extend(part.subject_ids.iter().cloned());
            truth.extend(part.true_targets.iter().copied());
            predicted.extend(part.predicted.iter().copied());
        }
        Predictions::new(ids, Array1::from(truth), Array1::from(predicted))
    }

    /// Mean prediction per subject, in order of first appearance. Collapses
    /// the R copies of each subject produced by repeated cross-validation.
    pub fn averaged_by_subject(&self) -> Predictions {
        let mut order: Vec<&str> = Vec::new();
        let mut sums: AHashMap<&str, (f64, f64, usize)> = AHashMap::new();
        for ((id, &truth), &predicted) in self
            .subject_ids
            .iter()
            .zip(self.true_targets.iter())
            .zip(self.predicted.iter())
        {
            let entry = sums.entry(id.as_str()).or_insert_with(|| {
                order.push(id.as_str());
                (truth, 0.0, 0)
            });
            entry.1 += predicted;
            entry.2 += 1;
        }
        let truth = order.iter().map(|id| sums[id].0).collect::<Array1<f64>>();
        let predicted = order
            .iter()
            .map(|id| {
                let (_, sum, count) = sums[id];
                sum / count as f64
            })
            .collect::<Array1<f64>>();
        Predictions::new(order.into_iter().map(str::to_string).collect(), truth, predicted)
    }
}

/// Predictions of one model on one held-out fold.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldResult {
    pub model: String,
    pub repetition: usize,
    pub fold: usize,
    pub predictions: Predictions,
}

/// A fold whose model could not be fitted. Its subjects have no prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldFailure {
    pub model: String,
    pub repetition: usize,
    pub fold: usize,
    pub subject_ids: Vec<String>,
    pub true_targets: Array1<f64>,
    pub error: FitError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    Completed(FoldResult),
    Failed(FoldFailure),
}

impl FoldOutcome {
    pub fn model(&self) -> &str {
        match self {
            Self::Completed(result) => &result.model,
            Self::Failed(failure) => &failure.model,
        }
    }

    pub fn repetition(&self) -> usize {
        match self {
            Self::Completed(result) => result.repetition,
            Self::Failed(failure) => failure.repetition,
        }
    }

    pub fn fold(&self) -> usize {
        match self {
            Self::Completed(result) => result.fold,
            Self::Failed(failure) => failure.fold,
        }
    }

    pub fn completed(&self) -> Option<&FoldResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Failed(_) => None,
        }
    }
}

/// All completed held-out predictions of `model`, in (repetition, fold) order.
pub fn pooled_predictions(model: &str, outcomes: &[FoldOutcome]) -> Option<Predictions> {
    let parts: Vec<&Predictions> = outcomes
        .iter()
        .filter(|o| o.model() == model)
        .filter_map(FoldOutcome::completed)
        .map(|r| &r.predictions)
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(Predictions::concat(parts))
    }
}

/// Mean and sample standard deviation of a metric across folds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub sd: f64,
}

impl MetricSummary {
    /// Summarises the finite values; `NaN` fields when there are too few.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        let n = finite.len();
        if n == 0 {
            return Self {
                mean: f64::NAN,
                sd: f64::NAN,
            };
        }
        let mean = finite.iter().sum::<f64>() / n as f64;
        let sd = if n > 1 {
            (finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Self { mean, sd }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Evaluated,
    Failed,
}

/// One row of the comparison table.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub model: String,
    pub status: ModelStatus,
    pub folds_completed: usize,
    pub folds_failed: usize,
    /// Metrics over every held-out prediction of the model, pooled.
    pub pooled: Option<RegressionMetrics>,
    pub per_fold: BTreeMap<&'static str, MetricSummary>,
}

impl ModelSummary {
    pub fn fold_summary(&self, metric: Metric) -> Option<MetricSummary> {
        self.per_fold.get(metric.as_str()).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonTable {
    pub rows: Vec<ModelSummary>,
}

impl ComparisonTable {
    /// Builds one row per model, in the order of `model_names`. A model whose
    /// every fold failed is marked [`ModelStatus::Failed`].
    pub fn from_outcomes(model_names: &[String], outcomes: &[FoldOutcome]) -> Self {
        let rows = model_names
            .iter()
            .map(|model| {
                let (completed, failed): (Vec<&FoldOutcome>, Vec<&FoldOutcome>) = outcomes
                    .iter()
                    .filter(|o| o.model() == model)
                    .partition(|o| o.completed().is_some());
                let fold_metrics: Vec<RegressionMetrics> = completed
                    .iter()
                    .filter_map(|o| o.completed())
                    .map(|r| r.predictions.metrics())
                    .collect();
                let per_fold = Metric::ALL
                    .iter()
                    .map(|&metric| {
                        (
                            metric.as_str(),
                            MetricSummary::of(fold_metrics.iter().map(|m| m.get(metric))),
                        )
                    })
                    .collect();
                let status = if completed.is_empty() {
                    ModelStatus::Failed
                } else {
                    ModelStatus::Evaluated
                };
                ModelSummary {
                    model: model.clone(),
                    status,
                    folds_completed: completed.len(),
                    folds_failed: failed.len(),
                    pooled: pooled_predictions(model, outcomes).map(|p| p.metrics()),
                    per_fold,
                }
            })
            .collect();
        Self { rows }
    }

    pub fn get(&self, model: &str) -> Option<&ModelSummary> {
        self.rows.iter().find(|row| row.model == model)
    }

    /// Models that failed on every fold.
    pub fn failed_models(&self) -> Vec<&str> {
        self.rows
            .iter()
            .filter(|row| row.status == ModelStatus::Failed)
            .map(|row| row.model.as_str())
            .collect()
    }
}

/// Error statistics of the subjects whose true age falls in `[age, age + 1)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgeBin {
    pub age: i64,
    pub n: usize,
    pub percentage: f64,
    pub mae: f64,
}

pub fn error_by_age(predictions: &Predictions) -> Vec<AgeBin> {
    let mut bins: BTreeMap<i64, (usize, f64)> = BTreeMap::new();
    for (truth, residual) in predictions
        .true_targets
        .iter()
        .zip(predictions.residuals.iter())
    {
        let bin = bins.entry(truth.floor() as i64).or_insert((0, 0.0));
        bin.0 += 1;
        bin.1 += residual.abs();
    }
    let total = predictions.len() as f64;
    bins.into_iter()
        .map(|(age, (n, absolute))| AgeBin {
            age,
            n,
            percentage: 100.0 * n as f64 / total,
            mae: absolute / n as f64,
        })
        .collect()
}
