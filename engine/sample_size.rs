//! # Sample-Size Analyzer
//!
//! Traces performance against training-set size. For every requested size
//! and repetition a subsample of the pool is drawn, cross-validated, and
//! optionally scored on an external cohort with the resulting fold models.
//! Each model is also fitted once on the whole subsample and scored on it, so
//! the in-sample fit can be set against the cross-validated one.
//!
//! Draws are independent across repetitions. Under [`SubsamplePolicy::Nested`]
//! each repetition draws one ordering of the pool and every size takes a
//! prefix of it, so smaller subsamples are contained in larger ones.

use crate::cv::{CvPlan, run_cross_validation};
use crate::data::Dataset;
use crate::error::{ComparisonError, ConfigurationError};
use crate::family::{self, ModelSpec, validate_specs};
use crate::generalize::{CohortModels, OverlapPolicy, check_cohort, evaluate_generalization};
use crate::metrics::{Metric, MetricSummary, ModelStatus, RegressionMetrics};
use crate::progress::{NoopProgress, ProgressObserver, Stage};
use crate::scaler::quantile;
use crate::seeding::{SeedStream, task_rng, task_seed, task_seed2};
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsamplePolicy {
    #[default]
    Independent,
    Nested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleSizePlan {
    pub sizes: Vec<usize>,
    pub repetitions: usize,
    pub seed: u64,
    pub policy: SubsamplePolicy,
}

impl Default for SampleSizePlan {
    fn default() -> Self {
        Self {
            sizes: Vec::new(),
            repetitions: 10,
            seed: 42,
            policy: SubsamplePolicy::Independent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationContext {
    CrossValidation,
    /// In-sample fit on the whole subsample.
    Training,
    Generalization,
}

impl EvaluationContext {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrossValidation => "cross_validation",
            Self::Training => "training",
            Self::Generalization => "generalization",
        }
    }
}

/// One model's result for one (size, repetition) draw.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSizePoint {
    pub model: String,
    pub size: usize,
    pub repetition: usize,
    pub context: EvaluationContext,
    /// `None` when the model failed on every fold of this draw.
    pub metrics: Option<RegressionMetrics>,
}

/// Every point of one model in one context, ordered by (size, repetition).
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSizeCurve {
    pub model: String,
    pub context: EvaluationContext,
    pub points: Vec<SampleSizePoint>,
}

/// Mean and central 95% band of a metric at one size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurvePoint {
    pub size: usize,
    pub mean: f64,
    pub sd: f64,
    pub lower: f64,
    pub upper: f64,
    /// Repetitions contributing a finite value.
    pub n: usize,
}

impl SampleSizeCurve {
    pub fn summarize(&self, metric: Metric) -> Vec<CurvePoint> {
        self.points
            .iter()
            .chunk_by(|p| p.size)
            .into_iter()
            .map(|(size, points)| {
                let mut values: Vec<f64> = points
                    .filter_map(|p| p.metrics.map(|m| m.get(metric)))
                    .filter(|v| v.is_finite())
                    .collect();
                values.sort_by(f64::total_cmp);
                let summary = MetricSummary::of(values.iter().copied());
                CurvePoint {
                    size,
                    mean: summary.mean,
                    sd: summary.sd,
                    lower: quantile(&values, 0.025),
                    upper: quantile(&values, 0.975),
                    n: values.len(),
                }
            })
            .collect()
    }
}

fn validate_plan(
    pool: &Dataset,
    plan: &SampleSizePlan,
    cv: &CvPlan,
) -> Result<Vec<usize>, ComparisonError> {
    if plan.sizes.is_empty() {
        return Err(ConfigurationError::ZeroCount("training-set size").into());
    }
    if plan.repetitions == 0 {
        return Err(ConfigurationError::ZeroCount("sample-size repetition").into());
    }
    let sizes: Vec<usize> = plan.sizes.iter().copied().sorted().dedup().collect();
    for &size in &sizes {
        if size > pool.len() {
            return Err(ConfigurationError::SampleSizeExceedsPool {
                size,
                pool: pool.len(),
            }
            .into());
        }
        if size < cv.folds {
            return Err(ComparisonError::insufficient(
                "sample-size cross-validation",
                size,
                cv.folds,
            ));
        }
    }
    Ok(sizes)
}

/// Row indices of one draw.
fn draw(
    pool_size: usize,
    size: usize,
    size_index: usize,
    repetition: usize,
    plan: &SampleSizePlan,
) -> Vec<usize> {
    let mut rows = match plan.policy {
        SubsamplePolicy::Independent => {
            let mut rng = task_rng(task_seed2(
                plan.seed,
                SeedStream::Subsample,
                size_index as u64,
                repetition as u64,
            ));
            sample(&mut rng, pool_size, size).into_vec()
        }
        SubsamplePolicy::Nested => {
            let mut rng = task_rng(task_seed(plan.seed, SeedStream::Subsample, repetition as u64));
            let mut order: Vec<usize> = (0..pool_size).collect();
            order.shuffle(&mut rng);
            order.truncate(size);
            order
        }
    };
    rows.sort_unstable();
    rows
}

/// Runs the learning-curve analysis of every spec on `pool`.
///
/// Returns one curve per model for cross-validation, one for the in-sample
/// training fit and, when `external` is given, one more for generalization
/// to it.
pub fn run_sample_size_analysis(
    pool: &Dataset,
    specs: &[ModelSpec],
    plan: &SampleSizePlan,
    cv: &CvPlan,
    external: Option<&Dataset>,
    progress: &dyn ProgressObserver,
) -> Result<Vec<SampleSizeCurve>, ComparisonError> {
    validate_specs(specs)?;
    let sizes = validate_plan(pool, plan, cv)?;
    if let Some(external) = external {
        check_cohort(pool, external)?;
    }
    log::info!(
        "Sample-size analysis: sizes {:?}, {} repetition(s) each, {} subsampling.",
        sizes,
        plan.repetitions,
        match plan.policy {
            SubsamplePolicy::Independent => "independent",
            SubsamplePolicy::Nested => "nested",
        }
    );

    let tasks: Vec<(usize, usize)> = (0..sizes.len())
        .cartesian_product(0..plan.repetitions)
        .collect();
    progress.on_stage_start(Stage::SampleSize, tasks.len());
    let per_task: Vec<Vec<SampleSizePoint>> = tasks
        .into_par_iter()
        .map(|(size_index, repetition)| {
            let size = sizes[size_index];
            let subsample = pool.subset(&draw(pool.len(), size, size_index, repetition, plan));
            let draw_plan = CvPlan {
                seed: task_seed2(cv.seed, SeedStream::Subsample, size as u64, repetition as u64),
                retain_models: external.is_some(),
                ..cv.clone()
            };
            let points = evaluate_draw(&subsample, specs, &draw_plan, external, size, repetition);
            progress.on_advance(Stage::SampleSize, 1);
            points
        })
        .collect::<Result<_, _>>()?;
    progress.on_stage_finish(Stage::SampleSize);

    let points: Vec<SampleSizePoint> = per_task.into_iter().flatten().collect();
    let mut contexts = vec![EvaluationContext::CrossValidation, EvaluationContext::Training];
    if external.is_some() {
        contexts.push(EvaluationContext::Generalization);
    }
    let curves = contexts
        .into_iter()
        .flat_map(|context| specs.iter().map(move |spec| (context, spec.name())))
        .map(|(context, model)| SampleSizeCurve {
            points: points
                .iter()
                .filter(|p| p.context == context && p.model == model)
                .cloned()
                .collect(),
            model,
            context,
        })
        .collect();
    Ok(curves)
}

fn evaluate_draw(
    subsample: &Dataset,
    specs: &[ModelSpec],
    plan: &CvPlan,
    external: Option<&Dataset>,
    size: usize,
    repetition: usize,
) -> Result<Vec<SampleSizePoint>, ComparisonError> {
    let report = run_cross_validation(subsample, specs, plan, &NoopProgress)?;
    let table = report.table();
    let point = |model: &str, context, metrics| SampleSizePoint {
        model: model.to_string(),
        size,
        repetition,
        context,
        metrics,
    };

    let mut points: Vec<SampleSizePoint> = table
        .rows
        .iter()
        .map(|row| {
            let metrics = match row.status {
                ModelStatus::Evaluated => row.pooled,
                ModelStatus::Failed => None,
            };
            point(&row.model, EvaluationContext::CrossValidation, metrics)
        })
        .collect();
    points.extend(specs.iter().enumerate().map(|(index, spec)| {
        let seed = task_seed(plan.seed, SeedStream::ModelFit, index as u64);
        point(&spec.name(), EvaluationContext::Training, training_fit(subsample, spec, seed))
    }));

    if let Some(external) = external {
        let names = report.model_names.clone();
        if report.models.is_empty() {
            points.extend(
                names
                    .iter()
                    .map(|m| point(m, EvaluationContext::Generalization, None)),
            );
        } else {
            let models = CohortModels::from_report(report, subsample)?;
            let generalization = evaluate_generalization(
                &models,
                external,
                None,
                OverlapPolicy::HeldOutOnly,
                &NoopProgress,
            )?;
            points.extend(names.iter().map(|m| {
                let metrics = generalization
                    .get(m)
                    .filter(|r| !r.predictions.is_empty())
                    .map(|r| r.metrics());
                point(m, EvaluationContext::Generalization, metrics)
            }));
        }
    }
    Ok(points)
}

/// Scores `spec` on the subjects it was fitted to. `None` if the fit failed.
fn training_fit(subsample: &Dataset, spec: &ModelSpec, seed: u64) -> Option<RegressionMetrics> {
    let x = subsample.features().view();
    let fitted = family::fit(x, subsample.targets().view(), spec, seed)
        .map(|model| model.predict(x))
        .inspect_err(|e| log::debug!("{} training fit failed: {e}", spec.name()))
        .ok()?;
    fitted
        .iter()
        .all(|p| p.is_finite())
        .then(|| RegressionMetrics::compute(subsample.targets().view(), fitted.view()))
}
