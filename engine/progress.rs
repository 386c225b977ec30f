use std::fmt;

/// Pipeline stages that report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    CrossValidation,
    Generalization,
    Permutation,
    SampleSize,
}

impl Stage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::CrossValidation => "cross-validation fold fits",
            Self::Generalization => "generalization scoring",
            Self::Permutation => "permutation trials",
            Self::SampleSize => "sample-size draws",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress.
///
/// Tasks finish on rayon workers in arbitrary order, so `on_advance` is called
/// concurrently with a count of newly finished units, never a running total.
pub trait ProgressObserver: Sync {
    fn on_stage_start(&self, stage: Stage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_advance(&self, stage: Stage, finished_units: usize) {
        let _ = (stage, finished_units);
    }
    fn on_stage_finish(&self, stage: Stage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
