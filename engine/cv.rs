//! # Cross-Validation Runner
//!
//! Repeated K-fold cross-validation of several model specifications under one
//! shared protocol: every specification sees the same fold assignment in a
//! given repetition, so per-subject predictions of different models are paired.
//!
//! One rayon task per (model, repetition, fold). Tasks read the dataset and the
//! assignments, own their fitted model, and return a [`FoldOutcome`]; nothing
//! is shared mutably. Results come back in key order regardless of which
//! worker finished first.

use crate::data::{Dataset, StratifyBy};
use crate::error::{ComparisonError, ConfigurationError};
use crate::family::{self, FitError, ModelSpec, TrainedModel, validate_specs};
use crate::folds::{FoldAssignment, partition};
use crate::metrics::{
    ComparisonTable, FoldFailure, FoldOutcome, FoldResult, Predictions, pooled_predictions,
};
use crate::progress::{NoopProgress, ProgressObserver, Stage};
use crate::seeding::{SeedStream, task_seed, task_seed2};
use ahash::AHashSet;
use ndarray::Axis;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvPlan {
    pub folds: usize,
    pub repetitions: usize,
    pub seed: u64,
    pub stratify_by: Option<StratifyBy>,
    /// Keep every fold's trained model for later generalization scoring.
    pub retain_models: bool,
}

impl Default for CvPlan {
    fn default() -> Self {
        Self {
            folds: 10,
            repetitions: 1,
            seed: 42,
            stratify_by: None,
            retain_models: false,
        }
    }
}

/// A trained model together with the fold it was trained for.
#[derive(Debug, Clone)]
pub struct FoldModel {
    pub model: String,
    pub repetition: usize,
    pub fold: usize,
    pub trained: TrainedModel,
    /// Subjects this model never saw during training.
    pub held_out: AHashSet<String>,
}

#[derive(Debug, Clone)]
pub struct CvReport {
    pub model_names: Vec<String>,
    /// One assignment per repetition.
    pub assignments: Vec<FoldAssignment>,
    /// Ordered by (model, repetition, fold).
    pub outcomes: Vec<FoldOutcome>,
    /// Empty unless the plan retained models.
    pub models: Vec<FoldModel>,
}

impl CvReport {
    pub fn table(&self) -> ComparisonTable {
        ComparisonTable::from_outcomes(&self.model_names, &self.outcomes)
    }

    pub fn pooled(&self, model: &str) -> Option<Predictions> {
        pooled_predictions(model, &self.outcomes)
    }

    pub fn failures(&self) -> impl Iterator<Item = &FoldFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            FoldOutcome::Failed(failure) => Some(failure),
            FoldOutcome::Completed(_) => None,
        })
    }
}

/// Draws the fold assignment of every repetition.
pub fn partition_repetitions(
    dataset: &Dataset,
    plan: &CvPlan,
) -> Result<Vec<FoldAssignment>, ConfigurationError> {
    if plan.repetitions == 0 {
        return Err(ConfigurationError::ZeroCount("cross-validation repetition"));
    }
    let labels = plan
        .stratify_by
        .map(|by| dataset.stratification_labels(by))
        .transpose()?;
    (0..plan.repetitions)
        .map(|repetition| {
            partition(
                dataset.len(),
                labels,
                plan.folds,
                task_seed(plan.seed, SeedStream::FoldPartition, repetition as u64),
            )
        })
        .collect()
}

/// Runs repeated K-fold cross-validation of every spec on `dataset`.
///
/// Configuration problems abort before any fit. A fit failure only marks its
/// own (model, repetition, fold) as failed.
pub fn run_cross_validation(
    dataset: &Dataset,
    specs: &[ModelSpec],
    plan: &CvPlan,
    progress: &dyn ProgressObserver,
) -> Result<CvReport, ComparisonError> {
    validate_specs(specs)?;
    let assignments = partition_repetitions(dataset, plan)?;

    log::info!(
        "Cross-validating {} model(s) on {} subjects: {} repetition(s) x {} folds.",
        specs.len(),
        dataset.len(),
        plan.repetitions,
        plan.folds
    );
    let report = evaluate_assignments(dataset, specs, &assignments, plan, progress);
    for failure in report.failures() {
        log::warn!(
            "{} failed in repetition {} fold {}: {}",
            failure.model,
            failure.repetition,
            failure.fold,
            failure.error
        );
    }
    Ok(report)
}

/// Fits and scores every (spec, repetition, fold) of precomputed assignments.
pub(crate) fn evaluate_assignments(
    dataset: &Dataset,
    specs: &[ModelSpec],
    assignments: &[FoldAssignment],
    plan: &CvPlan,
    progress: &dyn ProgressObserver,
) -> CvReport {
    let tasks: Vec<(usize, usize, usize)> = (0..specs.len())
        .flat_map(|spec| {
            assignments.iter().enumerate().flat_map(move |(repetition, a)| {
                (0..a.num_folds()).map(move |fold| (spec, repetition, fold))
            })
        })
        .collect();

    progress.on_stage_start(Stage::CrossValidation, tasks.len());
    // Indexed parallel collect keeps task order.
    let results: Vec<(FoldOutcome, Option<FoldModel>)> = tasks
        .into_par_iter()
        .map(|(spec, repetition, fold)| {
            let result = evaluate_fold(
                dataset,
                &specs[spec],
                &assignments[repetition],
                repetition,
                fold,
                plan,
            );
            progress.on_advance(Stage::CrossValidation, 1);
            result
        })
        .collect();
    progress.on_stage_finish(Stage::CrossValidation);

    let mut outcomes = Vec::with_capacity(results.len());
    let mut models = Vec::new();
    for (outcome, model) in results {
        outcomes.push(outcome);
        models.extend(model);
    }
    CvReport {
        model_names: specs.iter().map(ModelSpec::name).collect(),
        assignments: assignments.to_vec(),
        outcomes,
        models,
    }
}

fn evaluate_fold(
    dataset: &Dataset,
    spec: &ModelSpec,
    assignment: &FoldAssignment,
    repetition: usize,
    fold: usize,
    plan: &CvPlan,
) -> (FoldOutcome, Option<FoldModel>) {
    let training = assignment.training(fold);
    let held_out = assignment.held_out(fold);
    let held_ids: Vec<String> = held_out.iter().map(|&i| dataset.ids()[i].clone()).collect();
    let held_truth = dataset.targets().select(Axis(0), &held_out);

    let x_train = dataset.features().select(Axis(0), &training);
    let y_train = dataset.targets().select(Axis(0), &training);
    let seed = task_seed2(plan.seed, SeedStream::ModelFit, repetition as u64, fold as u64);

    let fitted = family::fit(x_train.view(), y_train.view(), spec, seed).and_then(|trained| {
        let predicted = trained.predict(dataset.features().select(Axis(0), &held_out).view());
        if predicted.iter().all(|p| p.is_finite()) {
            Ok((trained, predicted))
        } else {
            Err(FitError::NonFiniteParameters {
                family: spec.family(),
            })
        }
    });

    match fitted {
        Ok((trained, predicted)) => {
            log::debug!(
                "{} repetition {repetition} fold {fold}: {}",
                spec.name(),
                trained.regressor()
            );
            let model = plan.retain_models.then(|| FoldModel {
                model: spec.name(),
                repetition,
                fold,
                trained,
                held_out: held_ids.iter().cloned().collect(),
            });
            let outcome = FoldOutcome::Completed(FoldResult {
                model: spec.name(),
                repetition,
                fold,
                predictions: Predictions::new(held_ids, held_truth, predicted),
            });
            (outcome, model)
        }
        Err(error) => (
            FoldOutcome::Failed(FoldFailure {
                model: spec.name(),
                repetition,
                fold,
                subject_ids: held_ids,
                true_targets: held_truth,
                error,
            }),
            None,
        ),
    }
}

/// Pooled held-out predictions of one spec over precomputed assignments.
/// Fails only if every fold failed.
pub(crate) fn pooled_cv_predictions(
    dataset: &Dataset,
    spec: &ModelSpec,
    assignments: &[FoldAssignment],
    plan: &CvPlan,
) -> Result<Predictions, FitError> {
    let report = evaluate_assignments(
        dataset,
        std::slice::from_ref(spec),
        assignments,
        plan,
        &NoopProgress,
    );
    match report.pooled(&spec.name()) {
        Some(predictions) => Ok(predictions),
        None => Err(report
            .failures()
            .next()
            .map(|f| f.error.clone())
            .unwrap_or(FitError::EmptyTrainingSet {
                family: spec.family(),
            })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{ModelFamily, RvmSpec, SvmSpec};
    use crate::metrics::ModelStatus;
    use ndarray::{Array1, Array2};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn synthetic(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let x = Array2::from_shape_fn((n, 5), |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(n, |i| {
            50.0 + 6.0 * x[[i, 0]] + 4.0 * x[[i, 3]] + 0.5 * normal.sample(&mut rng)
        });
        let ids = (0..n).map(|i| format!("sub-{i:03}")).collect();
        let names = (0..5).map(|j| format!("f{j}")).collect();
        let sex = (0..n)
            .map(|i| if i % 2 == 0 { "F" } else { "M" }.to_string())
            .collect();
        Dataset::new(ids, x, y, names).unwrap().with_sex(sex).unwrap()
    }

    #[test]
    fn every_subject_is_predicted_once_per_repetition() {
        let data = synthetic(40, 1);
        let plan = CvPlan {
            folds: 4,
            repetitions: 2,
            ..CvPlan::default()
        };
        let gpr = [ModelSpec::defaults(ModelFamily::Gpr)];
        let report = run_cross_validation(&data, &gpr, &plan, &NoopProgress).unwrap();
        assert_eq!(report.outcomes.len(), 8);
        for repetition in 0..2 {
            let mut seen: Vec<String> = report
                .outcomes
                .iter()
                .filter(|o| o.repetition() == repetition)
                .filter_map(|o| o.completed())
                .flat_map(|r| r.predictions.subject_ids.clone())
                .collect();
            seen.sort();
            let mut expected = data.ids().to_vec();
            expected.sort();
            assert_eq!(seen, expected);
        }
        // Outcomes are in key order.
        let keys: Vec<(usize, usize)> = report
            .outcomes
            .iter()
            .map(|o| (o.repetition(), o.fold()))
            .collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (0, 2), (0, 3), (1, 0), (1, 1), (1, 2), (1, 3)]);
    }

    #[test]
    fn retained_models_never_trained_on_their_held_out_subjects() {
        let data = synthetic(30, 2);
        let plan = CvPlan {
            folds: 3,
            retain_models: true,
            stratify_by: Some(StratifyBy::Sex),
            ..CvPlan::default()
        };
        let gpr = [ModelSpec::defaults(ModelFamily::Gpr)];
        let report = run_cross_validation(&data, &gpr, &plan, &NoopProgress).unwrap();
        assert_eq!(report.models.len(), 3);
        let assignment = &report.assignments[0];
        for model in &report.models {
            for row in assignment.training(model.fold) {
                assert!(!model.held_out.contains(&data.ids()[row]));
            }
            assert_eq!(model.held_out.len(), assignment.held_out(model.fold).len());
        }
    }

    #[test]
    fn fit_failures_are_recorded_not_raised() {
        let data = synthetic(30, 3);
        let specs = vec![
            ModelSpec::Rvm(RvmSpec {
                name: Some("RVM-capped".to_string()),
                max_iterations: 1,
                ..RvmSpec::default()
            }),
            ModelSpec::Svm(SvmSpec {
                c: Some(10.0),
                ..SvmSpec::default()
            }),
        ];
        let plan = CvPlan {
            folds: 3,
            ..CvPlan::default()
        };
        let report = run_cross_validation(&data, &specs, &plan, &NoopProgress).unwrap();
        assert_eq!(report.failures().count(), 3);
        let table = report.table();
        assert_eq!(table.get("RVM-capped").unwrap().status, ModelStatus::Failed);
        assert_eq!(table.get("SVM").unwrap().status, ModelStatus::Evaluated);
        assert_eq!(table.failed_models(), vec!["RVM-capped"]);
    }

    #[test]
    fn results_do_not_depend_on_thread_count() {
        let data = synthetic(36, 4);
        let specs = vec![ModelSpec::defaults(ModelFamily::Svm)];
        let plan = CvPlan {
            folds: 4,
            ..CvPlan::default()
        };
        let run = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
            pool.install(|| run_cross_validation(&data, &specs, &plan, &NoopProgress).unwrap())
        };
        assert_eq!(run(1).outcomes, run(4).outcomes);
    }

    #[test]
    fn configuration_errors_abort_before_fitting() {
        let data = synthetic(20, 5);
        let specs = vec![ModelSpec::defaults(ModelFamily::Gpr)];
        let too_many = CvPlan {
            folds: 21,
            ..CvPlan::default()
        };
        assert!(matches!(
            run_cross_validation(&data, &specs, &too_many, &NoopProgress),
            Err(ComparisonError::Configuration(ConfigurationError::FoldsExceedSubjects { .. }))
        ));
        let by_site = CvPlan {
            folds: 2,
            stratify_by: Some(StratifyBy::Site),
            ..CvPlan::default()
        };
        assert!(matches!(
            run_cross_validation(&data, &specs, &by_site, &NoopProgress),
            Err(ComparisonError::Configuration(ConfigurationError::MissingStratificationColumn(_)))
        ));
    }
}
