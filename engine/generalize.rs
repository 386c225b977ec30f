//! # Generalization Evaluator
//!
//! Applies the fold models trained on one cohort to an independently acquired
//! cohort. Nothing is refitted. Each subject's reported prediction is the mean
//! over the fold models of its model family, and every fold model is also
//! scored on its own.
//!
//! When the evaluation cohort shares subjects with the training pool, the
//! default [`OverlapPolicy::HeldOutOnly`] only lets a fold model predict the
//! shared subjects it never trained on. Scoring a cohort against itself then
//! reproduces the cross-validation predictions.

use crate::cv::{CvReport, FoldModel};
use crate::data::Dataset;
use crate::error::{ComparisonError, ConfigurationError};
use crate::metrics::{Predictions, RegressionMetrics};
use crate::progress::{ProgressObserver, Stage};
use ahash::AHashSet;
use ndarray::{Array1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Smallest evaluation cohort for which metrics are reported.
pub const MIN_GENERALIZATION_SUBJECTS: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Subjects of the training pool are only predicted by fold models that
    /// held them out.
    #[default]
    HeldOutOnly,
    /// Every fold model predicts every subject.
    AllMembers,
}

/// The retained fold models of one cross-validation run.
#[derive(Debug, Clone)]
pub struct CohortModels {
    pool_ids: AHashSet<String>,
    feature_names: Vec<String>,
    model_names: Vec<String>,
    members: Vec<FoldModel>,
}

impl CohortModels {
    /// Takes the retained models of `report`, which was run on `pool`.
    pub fn from_report(report: CvReport, pool: &Dataset) -> Result<Self, ComparisonError> {
        if report.models.is_empty() {
            return Err(ComparisonError::insufficient(
                "generalization (retained fold models)",
                0,
                1,
            ));
        }
        Ok(Self {
            pool_ids: pool.ids().iter().cloned().collect(),
            feature_names: pool.feature_names().to_vec(),
            model_names: report.model_names,
            members: report.models,
        })
    }

    pub fn members(&self) -> &[FoldModel] {
        &self.members
    }

    pub fn model_names(&self) -> &[String] {
        &self.model_names
    }

    fn is_eligible(&self, member: &FoldModel, id: &str, policy: OverlapPolicy) -> bool {
        match policy {
            OverlapPolicy::AllMembers => true,
            OverlapPolicy::HeldOutOnly => {
                !self.pool_ids.contains(id) || member.held_out.contains(id)
            }
        }
    }
}

/// Score of a single fold model on the evaluation cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberScore {
    pub repetition: usize,
    pub fold: usize,
    pub metrics: RegressionMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralizationResult {
    pub model: String,
    /// Ensemble-mean predictions, in evaluation-cohort order.
    pub predictions: Predictions,
    pub members: Vec<MemberScore>,
    /// Subjects no eligible fold model could predict.
    pub unpredicted: Vec<String>,
}

impl GeneralizationResult {
    pub fn metrics(&self) -> RegressionMetrics {
        self.predictions.metrics()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralizationReport {
    pub results: Vec<GeneralizationResult>,
    /// Model families without a single retained fold model.
    pub failed_models: Vec<String>,
}

impl GeneralizationReport {
    pub fn get(&self, model: &str) -> Option<&GeneralizationResult> {
        self.results.iter().find(|r| r.model == model)
    }
}

/// Checks, before any model is trained on `pool`, that its models can be
/// scored on `cohort`.
pub fn check_cohort(pool: &Dataset, cohort: &Dataset) -> Result<(), ComparisonError> {
    pool.ensure_compatible(cohort)?;
    check_size(cohort)
}

fn check_size(cohort: &Dataset) -> Result<(), ComparisonError> {
    if cohort.len() < MIN_GENERALIZATION_SUBJECTS {
        return Err(ComparisonError::insufficient(
            "generalization cohort",
            cohort.len(),
            MIN_GENERALIZATION_SUBJECTS,
        ));
    }
    Ok(())
}

/// Scores `models` on `cohort`, optionally restricted to the subjects in
/// `include`.
pub fn evaluate_generalization(
    models: &CohortModels,
    cohort: &Dataset,
    include: Option<&AHashSet<String>>,
    policy: OverlapPolicy,
    progress: &dyn ProgressObserver,
) -> Result<GeneralizationReport, ComparisonError> {
    let cohort = match include {
        Some(ids) => cohort.filter_ids(ids),
        None => cohort.clone(),
    };
    if cohort.feature_names() != models.feature_names.as_slice() {
        return Err(ConfigurationError::FeatureMismatch {
            expected: models.feature_names.clone(),
            found: cohort.feature_names().to_vec(),
        }
        .into());
    }
    check_size(&cohort)?;
    let overlap = cohort
        .ids()
        .iter()
        .filter(|id| models.pool_ids.contains(id.as_str()))
        .count();
    log::info!(
        "Scoring {} fold model(s) on {} subjects ({overlap} shared with the training pool).",
        models.members.len(),
        cohort.len()
    );

    progress.on_stage_start(Stage::Generalization, models.members.len());
    let member_predictions: Vec<Array1<f64>> = models
        .members
        .par_iter()
        .map(|member| {
            let predicted = member.trained.predict(cohort.features().view());
            progress.on_advance(Stage::Generalization, 1);
            predicted
        })
        .collect();
    progress.on_stage_finish(Stage::Generalization);

    let mut results = Vec::new();
    let mut failed_models = Vec::new();
    for name in &models.model_names {
        let family: Vec<usize> = (0..models.members.len())
            .filter(|&m| &models.members[m].model == name)
            .collect();
        if family.is_empty() {
            log::warn!("{name} has no trained fold models; skipping generalization.");
            failed_models.push(name.clone());
            continue;
        }
        results.push(score_family(models, &cohort, name, &family, &member_predictions, policy));
    }
    Ok(GeneralizationReport {
        results,
        failed_models,
    })
}

fn score_family(
    models: &CohortModels,
    cohort: &Dataset,
    name: &str,
    family: &[usize],
    member_predictions: &[Array1<f64>],
    policy: OverlapPolicy,
) -> GeneralizationResult {
    let mut rows = Vec::new();
    let mut means = Vec::new();
    let mut unpredicted = Vec::new();
    for (row, id) in cohort.ids().iter().enumerate() {
        let (sum, count) = family
            .iter()
            .filter(|&&m| models.is_eligible(&models.members[m], id, policy))
            .fold((0.0, 0usize), |(sum, count), &m| {
                (sum + member_predictions[m][row], count + 1)
            });
        if count == 0 {
            unpredicted.push(id.clone());
        } else {
            rows.push(row);
            means.push(sum / count as f64);
        }
    }
    if !unpredicted.is_empty() {
        log::warn!(
            "{name}: {} subject(s) have no eligible fold model and are left unpredicted.",
            unpredicted.len()
        );
    }

    let members = family
        .iter()
        .map(|&m| {
            let member = &models.members[m];
            let eligible: Vec<usize> = (0..cohort.len())
                .filter(|&row| models.is_eligible(member, &cohort.ids()[row], policy))
                .collect();
            MemberScore {
                repetition: member.repetition,
                fold: member.fold,
                metrics: RegressionMetrics::compute(
                    cohort.targets().select(Axis(0), &eligible).view(),
                    member_predictions[m].select(Axis(0), &eligible).view(),
                ),
            }
        })
        .collect();

    GeneralizationResult {
        model: name.to_string(),
        predictions: Predictions::new(
            rows.iter().map(|&r| cohort.ids()[r].clone()).collect(),
            cohort.targets().select(Axis(0), &rows),
            Array1::from(means),
        ),
        members,
        unpredicted,
    }
}
