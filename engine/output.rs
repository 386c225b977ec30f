//! Result tables.
//!
//! Every table is tab separated with a header row. Numbers that do not exist
//! (a subject of a failed fold, an undefined correlation) are written as `NA`
//! and failed rows carry `status = failed`; nothing is filled in.

use crate::generalize::GeneralizationReport;
use crate::metrics::{AgeBin, ComparisonTable, FoldOutcome, Metric, ModelStatus, RegressionMetrics};
use crate::permutation::PermutationDistribution;
use crate::sample_size::{SampleSizeCurve, SampleSizePoint};
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const MISSING: &str = "NA";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write output file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write output table: {0}")]
    CsvError(#[from] csv::Error),
}

fn tsv_writer(path: &Path) -> Result<Writer<File>, OutputError> {
    Ok(WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

fn write_rows<T: Serialize>(
    path: &Path,
    rows: impl IntoIterator<Item = T>,
) -> Result<(), OutputError> {
    let mut writer = tsv_writer(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    log::info!("Wrote '{}'", path.display());
    Ok(())
}

fn cell(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        MISSING.to_string()
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "ok" } else { "failed" }
}

/// `n` followed by the metric columns shared by several tables.
struct MetricCells {
    n: usize,
    mae: String,
    rmse: String,
    r2: String,
    pearson: String,
    age_error_corr: String,
}

impl MetricCells {
    fn of(metrics: Option<&RegressionMetrics>) -> Self {
        match metrics {
            Some(m) => Self {
                n: m.n,
                mae: cell(m.mae),
                rmse: cell(m.rmse),
                r2: cell(m.r2),
                pearson: cell(m.pearson),
                age_error_corr: cell(m.age_error_corr),
            },
            None => Self {
                n: 0,
                mae: MISSING.to_string(),
                rmse: MISSING.to_string(),
                r2: MISSING.to_string(),
                pearson: MISSING.to_string(),
                age_error_corr: MISSING.to_string(),
            },
        }
    }
}

#[derive(Serialize)]
struct PredictionRow<'a> {
    model: &'a str,
    repetition: usize,
    fold: usize,
    subject_id: &'a str,
    age: f64,
    predicted: String,
    residual: String,
    status: &'static str,
}

/// One row per (model, repetition, fold, subject).
pub fn write_cv_predictions(path: &Path, outcomes: &[FoldOutcome]) -> Result<(), OutputError> {
    let rows = outcomes.iter().flat_map(|outcome| -> Vec<PredictionRow<'_>> {
        match outcome {
            FoldOutcome::Completed(result) => {
                let p = &result.predictions;
                (0..p.len())
                    .map(|i| PredictionRow {
                        model: &result.model,
                        repetition: result.repetition,
                        fold: result.fold,
                        subject_id: &p.subject_ids[i],
                        age: p.true_targets[i],
                        predicted: cell(p.predicted[i]),
                        residual: cell(p.residuals[i]),
                        status: status(true),
                    })
                    .collect()
            }
            FoldOutcome::Failed(failure) => failure
                .subject_ids
                .iter()
                .zip(failure.true_targets.iter())
                .map(|(id, &age)| PredictionRow {
                    model: &failure.model,
                    repetition: failure.repetition,
                    fold: failure.fold,
                    subject_id: id,
                    age,
                    predicted: MISSING.to_string(),
                    residual: MISSING.to_string(),
                    status: status(false),
                })
                .collect(),
        }
    });
    write_rows(path, rows)
}

#[derive(Serialize)]
struct ComparisonRow<'a> {
    model: &'a str,
    status: ModelStatus,
    folds_completed: usize,
    folds_failed: usize,
    n: usize,
    mae: String,
    rmse: String,
    r2: String,
    pearson: String,
    age_error_corr: String,
    mae_fold_mean: String,
    mae_fold_sd: String,
    rmse_fold_mean: String,
    rmse_fold_sd: String,
    r2_fold_mean: String,
    r2_fold_sd: String,
    pearson_fold_mean: String,
    pearson_fold_sd: String,
}

/// One summary row per model.
pub fn write_comparison(path: &Path, table: &ComparisonTable) -> Result<(), OutputError> {
    let rows = table.rows.iter().map(|row| {
        let fold = |metric: Metric| {
            row.fold_summary(metric)
                .map_or((MISSING.to_string(), MISSING.to_string()), |s| (cell(s.mean), cell(s.sd)))
        };
        let (mae_fold_mean, mae_fold_sd) = fold(Metric::Mae);
        let (rmse_fold_mean, rmse_fold_sd) = fold(Metric::Rmse);
        let (r2_fold_mean, r2_fold_sd) = fold(Metric::R2);
        let (pearson_fold_mean, pearson_fold_sd) = fold(Metric::Pearson);
        let pooled = MetricCells::of(row.pooled.as_ref());
        ComparisonRow {
            model: &row.model,
            status: row.status,
            folds_completed: row.folds_completed,
            folds_failed: row.folds_failed,
            n: pooled.n,
            mae: pooled.mae,
            rmse: pooled.rmse,
            r2: pooled.r2,
            pearson: pooled.pearson,
            age_error_corr: pooled.age_error_corr,
            mae_fold_mean,
            mae_fold_sd,
            rmse_fold_mean,
            rmse_fold_sd,
            r2_fold_mean,
            r2_fold_sd,
            pearson_fold_mean,
            pearson_fold_sd,
        }
    });
    write_rows(path, rows)
}

/// A labelled permutation distribution, e.g. ("SVM", "mae") or ("SVM-vs-GPR", "mae_difference").
pub struct PermutationEntry<'a> {
    pub label: String,
    pub statistic: String,
    pub distribution: &'a PermutationDistribution,
}

#[derive(Serialize)]
struct PermutationRow<'a> {
    model: &'a str,
    statistic: &'a str,
    permutation: usize,
    value: String,
}

/// One row per (model, permutation index).
pub fn write_permutation_runs(
    path: &Path,
    entries: &[PermutationEntry<'_>],
) -> Result<(), OutputError> {
    let rows = entries.iter().flat_map(|entry| {
        entry.distribution.runs.iter().map(move |run| PermutationRow {
            model: &entry.label,
            statistic: &entry.statistic,
            permutation: run.index,
            value: cell(run.statistic),
        })
    });
    write_rows(path, rows)
}

#[derive(Serialize)]
struct PermutationSummaryRow<'a> {
    model: &'a str,
    statistic: &'a str,
    observed: String,
    permutations: usize,
    null_mean: String,
    null_sd: String,
    p_value: f64,
}

pub fn write_permutation_summary(
    path: &Path,
    entries: &[PermutationEntry<'_>],
) -> Result<(), OutputError> {
    let rows = entries.iter().map(|entry| {
        let null = entry.distribution.null_summary();
        PermutationSummaryRow {
            model: &entry.label,
            statistic: &entry.statistic,
            observed: cell(entry.distribution.observed),
            permutations: entry.distribution.runs.len(),
            null_mean: cell(null.mean),
            null_sd: cell(null.sd),
            p_value: entry.distribution.p_value(),
        }
    });
    write_rows(path, rows)
}

#[derive(Serialize)]
struct SampleSizeRow<'a> {
    model: &'a str,
    context: &'static str,
    size: usize,
    repetition: usize,
    n: usize,
    mae: String,
    rmse: String,
    r2: String,
    pearson: String,
    age_error_corr: String,
    status: &'static str,
}

impl<'a> SampleSizeRow<'a> {
    fn new(point: &'a SampleSizePoint) -> Self {
        let m = MetricCells::of(point.metrics.as_ref());
        Self {
            model: &point.model,
            context: point.context.as_str(),
            size: point.size,
            repetition: point.repetition,
            n: m.n,
            mae: m.mae,
            rmse: m.rmse,
            r2: m.r2,
            pearson: m.pearson,
            age_error_corr: m.age_error_corr,
            status: status(point.metrics.is_some()),
        }
    }
}

/// One row per (model, context, size, repetition).
pub fn write_sample_size(path: &Path, curves: &[SampleSizeCurve]) -> Result<(), OutputError> {
    let rows = curves
        .iter()
        .flat_map(|curve| curve.points.iter().map(SampleSizeRow::new));
    write_rows(path, rows)
}

#[derive(Serialize)]
struct CurveRow<'a> {
    model: &'a str,
    context: &'static str,
    metric: &'static str,
    size: usize,
    mean: String,
    sd: String,
    lower_95: String,
    upper_95: String,
    n: usize,
}

/// Mean, SD and 2.5/97.5 percentiles per (model, context, metric, size).
pub fn write_sample_size_summary(
    path: &Path,
    curves: &[SampleSizeCurve],
    metrics: &[Metric],
) -> Result<(), OutputError> {
    let rows = curves.iter().flat_map(|curve| {
        metrics.iter().flat_map(move |&metric| {
            curve.summarize(metric).into_iter().map(move |point| CurveRow {
                model: &curve.model,
                context: curve.context.as_str(),
                metric: metric.as_str(),
                size: point.size,
                mean: cell(point.mean),
                sd: cell(point.sd),
                lower_95: cell(point.lower),
                upper_95: cell(point.upper),
                n: point.n,
            })
        })
    });
    write_rows(path, rows)
}

#[derive(Serialize)]
struct GeneralizationRow<'a> {
    model: &'a str,
    subject_id: &'a str,
    age: f64,
    predicted: String,
    residual: String,
}

/// Ensemble predictions, one row per (model, subject).
pub fn write_generalization_predictions(
    path: &Path,
    report: &GeneralizationReport,
) -> Result<(), OutputError> {
    let rows = report.results.iter().flat_map(|result| {
        let p = &result.predictions;
        (0..p.len()).map(move |i| GeneralizationRow {
            model: &result.model,
            subject_id: &p.subject_ids[i],
            age: p.true_targets[i],
            predicted: cell(p.predicted[i]),
            residual: cell(p.residuals[i]),
        })
    });
    write_rows(path, rows)
}

#[derive(Serialize)]
struct GeneralizationSummaryRow<'a> {
    model: &'a str,
    member: String,
    n: usize,
    mae: String,
    rmse: String,
    r2: String,
    pearson: String,
    age_error_corr: String,
    status: &'static str,
}

impl<'a> GeneralizationSummaryRow<'a> {
    fn new(model: &'a str, member: String, metrics: Option<&RegressionMetrics>) -> Self {
        let m = MetricCells::of(metrics);
        Self {
            model,
            member,
            n: m.n,
            mae: m.mae,
            rmse: m.rmse,
            r2: m.r2,
            pearson: m.pearson,
            age_error_corr: m.age_error_corr,
            status: status(metrics.is_some()),
        }
    }
}

/// Ensemble metrics plus the score of every fold model, per model.
pub fn write_generalization_summary(
    path: &Path,
    report: &GeneralizationReport,
) -> Result<(), OutputError> {
    let mut rows = Vec::new();
    for result in &report.results {
        let ensemble = (!result.predictions.is_empty()).then(|| result.metrics());
        rows.push(GeneralizationSummaryRow::new(
            &result.model,
            "ensemble".to_string(),
            ensemble.as_ref(),
        ));
        for member in &result.members {
            rows.push(GeneralizationSummaryRow::new(
                &result.model,
                format!("rep{}_fold{}", member.repetition, member.fold),
                Some(&member.metrics),
            ));
        }
    }
    for model in &report.failed_models {
        rows.push(GeneralizationSummaryRow::new(model, "ensemble".to_string(), None));
    }
    write_rows(path, rows)
}

#[derive(Serialize)]
struct AgeRow<'a> {
    model: &'a str,
    age: i64,
    n: usize,
    percentage: f64,
    mae: f64,
}

/// Per-integer-age error table, one block per model.
pub fn write_error_by_age(
    path: &Path,
    entries: &[(String, Vec<AgeBin>)],
) -> Result<(), OutputError> {
    let rows = entries.iter().flat_map(|(model, bins)| {
        bins.iter().map(move |bin| AgeRow {
            model,
            age: bin.age,
            n: bin.n,
            percentage: bin.percentage,
            mae: bin.mae,
        })
    });
    write_rows(path, rows)
}
