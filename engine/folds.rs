//! Deterministic K-fold partitioning.
//!
//! Subjects are shuffled with a seeded generator and dealt round-robin into
//! folds, which keeps every fold within one subject of the others. With
//! stratification the deal runs stratum by stratum with a shared counter, so
//! each label is also spread evenly and the overall balance is preserved.

use crate::error::ConfigurationError;
use crate::seeding::task_rng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

/// Assignment of each subject (by dataset row) to exactly one fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    num_folds: usize,
    fold_of: Vec<usize>,
}

impl FoldAssignment {
    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn fold_of(&self, subject: usize) -> usize {
        self.fold_of[subject]
    }

    /// Rows evaluated by the model of `fold`.
    pub fn held_out(&self, fold: usize) -> Vec<usize> {
        self.rows_where(|f| f == fold)
    }

    /// Rows used to train the model of `fold`.
    pub fn training(&self, fold: usize) -> Vec<usize> {
        self.rows_where(|f| f != fold)
    }

    pub fn fold_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_folds];
        for &f in &self.fold_of {
            sizes[f] += 1;
        }
        sizes
    }

    fn rows_where(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        self.fold_of
            .iter()
            .enumerate()
            .filter(|&(_, &f)| keep(f))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Splits `num_subjects` subjects into `num_folds` folds.
///
/// `labels`, when given, must hold one stratification label per subject.
pub fn partition(
    num_subjects: usize,
    labels: Option<&[String]>,
    num_folds: usize,
    seed: u64,
) -> Result<FoldAssignment, ConfigurationError> {
    if num_folds < 2 {
        return Err(ConfigurationError::TooFewFolds(num_folds));
    }
    if num_folds > num_subjects {
        return Err(ConfigurationError::FoldsExceedSubjects {
            folds: num_folds,
            subjects: num_subjects,
        });
    }

    let mut rng = task_rng(seed);
    let mut fold_of = vec![0; num_subjects];

    match labels {
        None => {
            let mut order: Vec<usize> = (0..num_subjects).collect();
            order.shuffle(&mut rng);
            for (position, subject) in order.into_iter().enumerate() {
                fold_of[subject] = position % num_folds;
            }
        }
        Some(labels) => {
            debug_assert_eq!(labels.len(), num_subjects);
            // BTreeMap keeps the stratum order independent of hashing.
            let mut strata: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (subject, label) in labels.iter().enumerate() {
                strata.entry(label.as_str()).or_default().push(subject);
            }
            for (label, members) in &strata {
                if members.len() < num_folds {
                    return Err(ConfigurationError::StratumTooSmall {
                        label: label.to_string(),
                        members: members.len(),
                        folds: num_folds,
                    });
                }
            }
            let mut dealt = 0;
            for members in strata.values_mut() {
                members.shuffle(&mut rng);
                for &subject in members.iter() {
                    fold_of[subject] = dealt % num_folds;
                    dealt += 1;
                }
            }
        }
    }

    Ok(FoldAssignment { num_folds, fold_of })
}
