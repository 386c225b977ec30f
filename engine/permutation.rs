//! # Permutation Tester
//!
//! Two nulls are supported:
//!
//! - [`label_permutation_test`]: targets are shuffled across subjects and the
//!   whole cross-validation is rerun with the observed fold assignments. Tests
//!   whether a model predicts better than chance.
//! - [`paired_model_test`]: for each subject the predictions of two models are
//!   swapped with probability one half. Tests whether two models differ.
//!
//! Trials run concurrently, each with a generator seeded from its index, and
//! `p = (extreme + 1) / (P + 1)`.

use crate::cv::{CvPlan, partition_repetitions, pooled_cv_predictions};
use crate::data::Dataset;
use crate::error::{ComparisonError, ConfigurationError};
use crate::family::ModelSpec;
use crate::metrics::{Metric, MetricSummary, Predictions};
use crate::progress::{ProgressObserver, Stage};
use crate::seeding::{SeedStream, task_rng, task_seed};
use ahash::AHashMap;
use ndarray::Array1;
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fewest subjects a permutation test will run on.
pub const MIN_PERMUTATION_SUBJECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Mae,
    Rmse,
    R2,
    Pearson,
}

/// Which side of the null distribution counts as "at least as extreme".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tail {
    /// Smaller is better (errors).
    Lower,
    /// Larger is better (fit, correlation).
    Upper,
    TwoSided,
}

impl Statistic {
    pub fn metric(self) -> Metric {
        match self {
            Self::Mae => Metric::Mae,
            Self::Rmse => Metric::Rmse,
            Self::R2 => Metric::R2,
            Self::Pearson => Metric::Pearson,
        }
    }

    pub fn tail(self) -> Tail {
        match self {
            Self::Mae | Self::Rmse => Tail::Lower,
            Self::R2 | Self::Pearson => Tail::Upper,
        }
    }

    pub fn evaluate(self, predictions: &Predictions) -> f64 {
        predictions.metrics().get(self.metric())
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric().as_str())
    }
}

impl std::str::FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mae" => Ok(Self::Mae),
            "rmse" => Ok(Self::Rmse),
            "r2" => Ok(Self::R2),
            "pearson" | "r" => Ok(Self::Pearson),
            other => Err(format!(
                "unknown statistic '{other}' (expected mae, rmse, r2 or pearson)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermutationPlan {
    pub permutations: usize,
    pub seed: u64,
}

impl Default for PermutationPlan {
    fn default() -> Self {
        Self {
            permutations: 1000,
            seed: 42,
        }
    }
}

/// The statistic of one shuffled trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PermutationRun {
    pub index: usize,
    pub statistic: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermutationDistribution {
    pub observed: f64,
    /// Ordered by trial index.
    pub runs: Vec<PermutationRun>,
    pub tail: Tail,
}

impl PermutationDistribution {
    /// `(count(at least as extreme) + 1) / (P + 1)`. A trial whose statistic
    /// is undefined counts as extreme; an undefined observed value gives 1.
    pub fn p_value(&self) -> f64 {
        if !self.observed.is_finite() {
            return 1.0;
        }
        let extreme = self
            .runs
            .iter()
            .filter(|run| {
                let s = run.statistic;
                !s.is_finite()
                    || match self.tail {
                        Tail::Lower => s <= self.observed,
                        Tail::Upper => s >= self.observed,
                        Tail::TwoSided => s.abs() >= self.observed.abs(),
                    }
            })
            .count();
        (extreme + 1) as f64 / (self.runs.len() + 1) as f64
    }

    pub fn null_summary(&self) -> MetricSummary {
        MetricSummary::of(self.runs.iter().map(|r| r.statistic))
    }
}

fn check_trials(plan: &PermutationPlan) -> Result<(), ConfigurationError> {
    if plan.permutations == 0 {
        return Err(ConfigurationError::ZeroCount("permutation"));
    }
    Ok(())
}

/// Checks the trial count and cohort size of a label permutation test, so a
/// batch of tests can be rejected before the first one runs.
pub fn check_label_test(
    dataset: &Dataset,
    cv: &CvPlan,
    plan: &PermutationPlan,
) -> Result<(), ComparisonError> {
    check_trials(plan)?;
    let required = MIN_PERMUTATION_SUBJECTS.max(cv.folds);
    if dataset.len() < required {
        return Err(ComparisonError::insufficient(
            "label permutation test",
            dataset.len(),
            required,
        ));
    }
    Ok(())
}

/// Label-permutation test of one model's cross-validated `statistic`.
///
/// The observed value and every trial use the same fold assignments; only the
/// subject-to-target association is shuffled.
pub fn label_permutation_test(
    dataset: &Dataset,
    spec: &ModelSpec,
    cv: &CvPlan,
    statistic: Statistic,
    plan: &PermutationPlan,
    progress: &dyn ProgressObserver,
) -> Result<PermutationDistribution, ComparisonError> {
    check_label_test(dataset, cv, plan)?;
    spec.validate()?;
    let assignments = partition_repetitions(dataset, cv)?;

    let observed_predictions = pooled_cv_predictions(dataset, spec, &assignments, cv)?;
    let observed = statistic.evaluate(&observed_predictions);
    log::info!(
        "{}: observed {statistic} = {observed:.4}; running {} label permutations.",
        spec.name(),
        plan.permutations
    );

    progress.on_stage_start(Stage::Permutation, plan.permutations);
    let runs: Vec<PermutationRun> = (0..plan.permutations)
        .into_par_iter()
        .map(|index| {
            let mut rng = task_rng(task_seed(plan.seed, SeedStream::Permutation, index as u64));
            let mut targets = dataset.targets().to_vec();
            targets.shuffle(&mut rng);
            let permuted = dataset.with_targets(Array1::from(targets));
            let value = match pooled_cv_predictions(&permuted, spec, &assignments, cv) {
                Ok(predictions) => statistic.evaluate(&predictions),
                Err(e) => {
                    log::warn!("Permutation {index}: every fold failed ({e}).");
                    f64::NAN
                }
            };
            progress.on_advance(Stage::Permutation, 1);
            PermutationRun {
                index,
                statistic: value,
            }
        })
        .collect();
    progress.on_stage_finish(Stage::Permutation);

    Ok(PermutationDistribution {
        observed,
        runs,
        tail: statistic.tail(),
    })
}

/// Paired permutation test of `MAE(a) - MAE(b)`, two-sided.
///
/// Both prediction sets must cover the same subjects. Repeated predictions of
/// a subject (repeated cross-validation) are averaged first.
pub fn paired_model_test(
    model_a: &str,
    a: &Predictions,
    model_b: &str,
    b: &Predictions,
    plan: &PermutationPlan,
) -> Result<PermutationDistribution, ComparisonError> {
    check_trials(plan)?;
    let a = a.averaged_by_subject();
    let b = b.averaged_by_subject();
    let unpaired =
        || ConfigurationError::UnpairedPredictions(model_a.to_string(), model_b.to_string());
    if a.len() != b.len() {
        return Err(unpaired().into());
    }
    let position_in_b: AHashMap<&str, usize> = b
        .subject_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut errors_a = Vec::with_capacity(a.len());
    let mut errors_b = Vec::with_capacity(a.len());
    for (i, id) in a.subject_ids.iter().enumerate() {
        let j = *position_in_b.get(id.as_str()).ok_or_else(unpaired)?;
        errors_a.push(a.residuals[i].abs());
        errors_b.push(b.residuals[j].abs());
    }
    if a.len() < MIN_PERMUTATION_SUBJECTS {
        return Err(ComparisonError::insufficient(
            "paired model test",
            a.len(),
            MIN_PERMUTATION_SUBJECTS,
        ));
    }

    let n = errors_a.len() as f64;
    let mean_difference = |swap: &[bool]| {
        errors_a
            .iter()
            .zip(&errors_b)
            .zip(swap)
            .map(|((ea, eb), &swapped)| if swapped { eb - ea } else { ea - eb })
            .sum::<f64>()
            / n
    };
    let observed = mean_difference(&vec![false; errors_a.len()]);
    log::info!(
        "MAE({model_a}) - MAE({model_b}) = {observed:.4} on {} subjects; running {} paired permutations.",
        errors_a.len(),
        plan.permutations
    );

    let runs = (0..plan.permutations)
        .into_par_iter()
        .map(|index| {
            let mut rng = task_rng(task_seed(plan.seed, SeedStream::Permutation, index as u64));
            let swap: Vec<bool> = (0..errors_a.len()).map(|_| rng.gen_bool(0.5)).collect();
            PermutationRun {
                index,
                statistic: mean_difference(&swap),
            }
        })
        .collect();

    Ok(PermutationDistribution {
        observed,
        runs,
        tail: Tail::TwoSided,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{GprSpec, ModelFamily};
    use crate::progress::NoopProgress;
    use ndarray::{Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn signal(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let x = Array2::from_shape_fn((n, 3), |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(n, |i| {
            60.0 + 8.0 * x[[i, 0]] + 0.5 * normal.sample(&mut rng)
        });
        let ids = (0..n).map(|i| format!("s{i}")).collect();
        Dataset::new(ids, x, y, vec!["a".into(), "b".into(), "c".into()]).unwrap()
    }

    fn distribution(observed: f64, values: &[f64], tail: Tail) -> PermutationDistribution {
        PermutationDistribution {
            observed,
            runs: values
                .iter()
                .enumerate()
                .map(|(index, &statistic)| PermutationRun { index, statistic })
                .collect(),
            tail,
        }
    }

    #[test]
    fn p_value_counts_extreme_trials_plus_one() {
        let d = distribution(2.0, &[1.0, 3.0, 2.0, 5.0], Tail::Lower);
        assert_eq!(d.p_value(), 3.0 / 5.0);
        let d = distribution(0.9, &[0.1, 0.2, 0.95], Tail::Upper);
        assert_eq!(d.p_value(), 2.0 / 4.0);
        let d = distribution(-1.0, &[0.5, -1.5, 1.2], Tail::TwoSided);
        assert_eq!(d.p_value(), 3.0 / 4.0);
        let d = distribution(0.0, &[f64::NAN], Tail::Lower);
        assert_eq!(d.p_value(), 1.0);
    }

    #[test]
    fn undefined_observed_statistic_is_never_significant() {
        let values: Vec<f64> = (0..99).map(|i| 0.1 * i as f64).collect();
        for tail in [Tail::Upper, Tail::Lower, Tail::TwoSided] {
            assert_eq!(distribution(f64::NAN, &values, tail).p_value(), 1.0);
        }
        assert_eq!(distribution(f64::INFINITY, &values, Tail::Upper).p_value(), 1.0);
    }

    #[test]
    fn real_signal_is_significant_and_reproducible() {
        let data = signal(40, 1);
        let spec = ModelSpec::defaults(ModelFamily::Gpr);
        let cv = CvPlan {
            folds: 4,
            ..CvPlan::default()
        };
        let plan = PermutationPlan {
            permutations: 19,
            seed: 5,
        };
        let first =
            label_permutation_test(&data, &spec, &cv, Statistic::Mae, &plan, &NoopProgress)
                .unwrap();
        assert_eq!(first.runs.len(), 19);
        // Nothing beats the real labels, so p is the smallest attainable value.
        assert_eq!(first.p_value(), 1.0 / 20.0);
        let second =
            label_permutation_test(&data, &spec, &cv, Statistic::Mae, &plan, &NoopProgress)
                .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn too_few_subjects_is_insufficient_data() {
        let small = signal(12, 3).subset(&(0..9).collect::<Vec<_>>());
        let cv = CvPlan {
            folds: 3,
            ..CvPlan::default()
        };
        let spec = ModelSpec::Gpr(GprSpec::default());
        let plan = PermutationPlan::default();
        assert!(matches!(
            label_permutation_test(&small, &spec, &cv, Statistic::R2, &plan, &NoopProgress),
            Err(ComparisonError::InsufficientData { found: 9, required: 10, .. })
        ));
        let twelve_folds = CvPlan {
            folds: 12,
            ..CvPlan::default()
        };
        assert!(matches!(
            check_label_test(&signal(11, 3), &twelve_folds, &plan),
            Err(ComparisonError::InsufficientData { found: 11, required: 12, .. })
        ));
        assert!(check_label_test(&signal(12, 3), &twelve_folds, &plan).is_ok());
        let zero = PermutationPlan {
            permutations: 0,
            seed: 1,
        };
        assert!(matches!(
            label_permutation_test(&signal(20, 4), &spec, &cv, Statistic::R2, &zero, &NoopProgress),
            Err(ComparisonError::Configuration(ConfigurationError::ZeroCount(_)))
        ));
    }

    #[test]
    fn paired_test_detects_a_clearly_worse_model() {
        let ids: Vec<String> = (0..30).map(|i| format!("s{i}")).collect();
        let truth = Array1::from_shape_fn(30, |i| 20.0 + i as f64);
        let good = Predictions::new(ids.clone(), truth.clone(), &truth + 0.5);
        let bad = Predictions::new(ids, truth.clone(), &truth - 6.0);
        let plan = PermutationPlan {
            permutations: 200,
            seed: 9,
        };
        let d = paired_model_test("good", &good, "bad", &bad, &plan).unwrap();
        assert!((d.observed + 5.5).abs() < 1e-12);
        assert!(d.p_value() < 0.01, "p = {}", d.p_value());
        assert_eq!(d.tail, Tail::TwoSided);
    }

    #[test]
    fn paired_test_requires_the_same_subjects() {
        let a = Predictions::new(vec!["x".into(), "y".into()], array![1.0, 2.0], array![1.0, 2.0]);
        let b = Predictions::new(vec!["x".into(), "z".into()], array![1.0, 2.0], array![1.0, 2.0]);
        assert!(matches!(
            paired_model_test("A", &a, "B", &b, &PermutationPlan::default()),
            Err(ComparisonError::Configuration(ConfigurationError::UnpairedPredictions(_, _)))
        ));
    }
}
