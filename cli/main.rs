#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use ahash::AHashMap;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use brainage::config::ExperimentConfig;
use brainage::cv::run_cross_validation;
use brainage::data::{Dataset, StratifyBy, load_dataset, load_subject_list};
use brainage::error::ComparisonError;
use brainage::family::{ModelFamily, ModelSpec, validate_specs};
use brainage::generalize::{CohortModels, OverlapPolicy, check_cohort, evaluate_generalization};
use brainage::metrics::{ComparisonTable, Metric, error_by_age};
use brainage::output::{
    PermutationEntry, write_comparison, write_cv_predictions, write_error_by_age,
    write_generalization_predictions, write_generalization_summary, write_permutation_runs,
    write_permutation_summary, write_sample_size, write_sample_size_summary,
};
use brainage::permutation::{
    Statistic, check_label_test, label_permutation_test, paired_model_test,
};
use brainage::progress::{ProgressObserver, Stage};
use brainage::sample_size::{SubsamplePolicy, run_sample_size_analysis};

/// Exit status when a requested model family failed on every fold.
const EXIT_FAMILY_FAILED: i32 = 2;

#[derive(Clone, Copy, ValueEnum)]
pub enum StratifyCli {
    Sex,
    Site,
}

impl From<StratifyCli> for StratifyBy {
    fn from(value: StratifyCli) -> Self {
        match value {
            StratifyCli::Sex => StratifyBy::Sex,
            StratifyCli::Site => StratifyBy::Site,
        }
    }
}

/// Arguments shared by every analysis subcommand.
#[derive(Args)]
pub struct CohortArgs {
    /// Path to the feature table (TSV or CSV) with subject_id, age and feature columns
    #[arg(value_name = "FEATURES_PATH")]
    pub features: PathBuf,

    /// Name of the cohort, used to lay out the output directory
    #[arg(long)]
    pub cohort: String,

    /// Keep only subjects scanned at this site (matched against the site column)
    #[arg(long)]
    pub site: Option<String>,

    /// Comma-separated model families to evaluate (svm, rvm, gpr); all by default
    #[arg(long, value_delimiter = ',')]
    pub models: Vec<ModelFamily>,

    /// Number of cross-validation folds
    #[arg(long)]
    pub folds: Option<usize>,

    /// Number of cross-validation repetitions, each with its own partition
    #[arg(long)]
    pub repetitions: Option<usize>,

    /// Base seed for partitions, inner searches and permutations
    #[arg(long)]
    pub seed: Option<u64>,

    /// Keep the proportions of this covariate equal across folds
    #[arg(long, value_enum)]
    pub stratify_by: Option<StratifyCli>,

    /// Path to a file listing the subject IDs to include, one per line
    #[arg(long)]
    pub ids: Option<PathBuf>,

    /// TOML experiment file; flags given on the command line take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (defaults to the number of logical CPUs)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Root directory for result tables
    #[arg(long, default_value = "results")]
    pub out: PathBuf,
}

/// The second cohort of a generalization analysis.
#[derive(Args)]
pub struct TestCohortArgs {
    /// Path to the feature table of the cohort the models are applied to
    #[arg(long = "test", value_name = "PATH")]
    pub test_features: PathBuf,

    /// Keep only test-cohort subjects scanned at this site
    #[arg(long)]
    pub test_site: Option<String>,

    /// Path to a file listing the test-cohort subject IDs to include
    #[arg(long)]
    pub test_ids: Option<PathBuf>,

    /// Let every fold model predict pool subjects, not only those it held out
    #[arg(long)]
    pub all_members: bool,
}

#[derive(Parser)]
#[command(
    name = "brainage",
    about = "Cross-validated comparison and significance testing of brain-age models",
    long_about = "Trains SVM, RVM and GPR age regressors on one cohort, compares them under \
                 repeated K-fold cross-validation, applies them to a second cohort, and tests \
                 the results with permutations and learning curves."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-validate and compare model families on one cohort
    #[command(about = "Cross-validate model families (outputs: cv_predictions.tsv, comparison.tsv)")]
    Compare {
        #[command(flatten)]
        cohort: CohortArgs,
    },

    /// Apply the fold models of one cohort to another
    #[command(about = "Score cross-validated models on a second cohort (outputs: generalization_*.tsv)")]
    Generalize {
        #[command(flatten)]
        cohort: CohortArgs,

        #[command(flatten)]
        test: TestCohortArgs,
    },

    /// Build permutation null distributions for cross-validated performance
    #[command(about = "Label permutation tests (outputs: permutation_runs.tsv, permutation_summary.tsv)")]
    Permute {
        #[command(flatten)]
        cohort: CohortArgs,

        /// Number of permutation trials
        #[arg(long)]
        permutations: Option<usize>,

        /// Statistic to test: mae, rmse, r2 or pearson
        #[arg(long, default_value = "mae")]
        statistic: Statistic,

        /// Also test the MAE difference of every pair of models
        #[arg(long)]
        paired: bool,
    },

    /// Trace performance as a function of training-set size
    #[command(about = "Learning-curve analysis (outputs: sample_size.tsv, sample_size_summary.tsv)")]
    SampleSize {
        #[command(flatten)]
        cohort: CohortArgs,

        /// Comma-separated training-set sizes
        #[arg(long, value_delimiter = ',')]
        sizes: Vec<usize>,

        /// Number of subsamples drawn per size
        #[arg(long)]
        draws: Option<usize>,

        /// Grow one shuffled order per draw instead of drawing every size independently
        #[arg(long)]
        nested: bool,

        /// Optional second cohort every subsample is also scored on
        #[arg(long = "test", value_name = "PATH")]
        test_features: Option<PathBuf>,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

/// Whether every requested model family produced results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Complete,
    FamilyFailed,
}

impl RunStatus {
    fn from_table(table: &ComparisonTable) -> Self {
        let failed = table.failed_models();
        if failed.is_empty() {
            Self::Complete
        } else {
            log::error!("Every fold failed for: {}", failed.join(", "));
            Self::FamilyFailed
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Compare { cohort }) => run_compare(cohort),
        Some(Commands::Generalize { cohort, test }) => run_generalize(cohort, test),
        Some(Commands::Permute {
            cohort,
            permutations,
            statistic,
            paired,
        }) => run_permute(cohort, permutations, statistic, paired),
        Some(Commands::SampleSize {
            cohort,
            sizes,
            draws,
            nested,
            test_features,
        }) => run_sample_size(cohort, sizes, draws, nested, test_features),
        Some(Commands::Version) => {
            print_version_info();
            Ok(RunStatus::Complete)
        }
        None => print_help(),
    };

    match result {
        Ok(RunStatus::Complete) => {}
        Ok(RunStatus::FamilyFailed) => process::exit(EXIT_FAMILY_FAILED),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn print_help() -> Result<RunStatus, Box<dyn std::error::Error>> {
    Cli::command().print_help()?;
    println!();
    Ok(RunStatus::Complete)
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("BRAINAGE_RELEASE_TAG");

    println!("brainage {}", version);

    match release_tag {
        Some(tag) => println!("Release: {}", tag),
        None => println!("Release: development build"),
    }
}

// ========================================================================================
//                                  Shared setup
// ========================================================================================

/// Everything a subcommand needs once the flags and the experiment file are merged.
struct Session {
    config: ExperimentConfig,
    specs: Vec<ModelSpec>,
    dataset: Dataset,
    out_dir: PathBuf,
    pool: rayon::ThreadPool,
}

impl Session {
    fn prepare(args: &CohortArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match &args.config {
            Some(path) => {
                println!("Loading experiment file: {}", path.display());
                ExperimentConfig::load(path)?
            }
            None => ExperimentConfig::default(),
        };
        if let Some(folds) = args.folds {
            config.cross_validation.folds = folds;
        }
        if let Some(repetitions) = args.repetitions {
            config.cross_validation.repetitions = repetitions;
        }
        if let Some(seed) = args.seed {
            config.cross_validation.seed = seed;
            config.permutation.seed = seed;
            config.sample_size.seed = seed;
        }
        if let Some(stratify_by) = args.stratify_by {
            config.cross_validation.stratify_by = Some(stratify_by.into());
        }
        let specs = select_models(&config, &args.models);

        let dataset = load_cohort(
            &args.features,
            &config,
            args.site.as_deref(),
            args.ids.as_deref(),
        )?;
        println!(
            "Loaded {} subjects with {} features from {}",
            dataset.len(),
            dataset.num_features(),
            args.features.display()
        );

        let out_dir = args
            .out
            .join(&args.cohort)
            .join(args.site.as_deref().unwrap_or("all"));
        fs::create_dir_all(&out_dir)?;

        let threads = args.threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        log::info!("Using {threads} worker thread(s).");

        Ok(Self {
            config,
            specs,
            dataset,
            out_dir,
            pool,
        })
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.out_dir.join(file_name)
    }
}

/// The experiment's models, narrowed to (or extended by) the families on the command line.
fn select_models(config: &ExperimentConfig, families: &[ModelFamily]) -> Vec<ModelSpec> {
    let configured = config.model_specs();
    if families.is_empty() {
        return configured;
    }
    families
        .iter()
        .copied()
        .unique()
        .flat_map(|family| {
            let matching: Vec<ModelSpec> = configured
                .iter()
                .filter(|spec| spec.family() == family)
                .cloned()
                .collect();
            if matching.is_empty() {
                vec![ModelSpec::defaults(family)]
            } else {
                matching
            }
        })
        .collect()
}

fn load_cohort(
    path: &Path,
    config: &ExperimentConfig,
    site: Option<&str>,
    ids: Option<&Path>,
) -> Result<Dataset, Box<dyn std::error::Error>> {
    let mut dataset = load_dataset(path, &config.load)?;
    if let Some(site) = site {
        dataset = dataset.filter_site(site);
        log::info!("{} subjects remain at site '{site}'.", dataset.len());
    }
    if let Some(ids) = ids {
        let keep = load_subject_list(ids)?;
        dataset = dataset.filter_ids(&keep);
        log::info!(
            "{} subjects remain after applying the subject list '{}'.",
            dataset.len(),
            ids.display()
        );
    }
    Ok(dataset)
}

// ========================================================================================
//                                  Progress display
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

/// One progress bar per running stage.
#[derive(Default)]
struct BarProgress {
    bars: Mutex<AHashMap<Stage, ProgressBar>>,
}

impl BarProgress {
    fn bar(&self, stage: Stage) -> Option<ProgressBar> {
        self.bars.lock().ok()?.get(&stage).cloned()
    }
}

impl ProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: Stage, total_units: usize) {
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(stage, create_progress_bar(total_units as u64, stage.describe()));
        }
    }

    fn on_advance(&self, stage: Stage, finished_units: usize) {
        if let Some(pb) = self.bar(stage) {
            pb.inc(finished_units as u64);
        }
    }

    fn on_stage_finish(&self, stage: Stage) {
        let finished = self.bars.lock().ok().and_then(|mut bars| bars.remove(&stage));
        if let Some(pb) = finished {
            pb.finish_and_clear();
        }
    }
}

// ========================================================================================
//                                  Subcommands
// ========================================================================================

fn run_compare(args: CohortArgs) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let session = Session::prepare(&args)?;
    let progress = BarProgress::default();
    let report = session.pool.install(|| {
        run_cross_validation(
            &session.dataset,
            &session.specs,
            &session.config.cross_validation,
            &progress,
        )
    })?;

    write_cv_predictions(&session.path("cv_predictions.tsv"), &report.outcomes)?;
    let table = report.table();
    write_comparison(&session.path("comparison.tsv"), &table)?;
    let by_age: Vec<(String, Vec<_>)> = report
        .model_names
        .iter()
        .filter_map(|model| report.pooled(model).map(|p| (model.clone(), error_by_age(&p))))
        .collect();
    write_error_by_age(&session.path("mae_per_age.tsv"), &by_age)?;

    print_table(&table);
    Ok(RunStatus::from_table(&table))
}

fn run_generalize(
    args: CohortArgs,
    test: TestCohortArgs,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let mut session = Session::prepare(&args)?;
    session.config.cross_validation.retain_models = true;
    let external = load_cohort(
        &test.test_features,
        &session.config,
        test.test_site.as_deref(),
        test.test_ids.as_deref(),
    )?;
    check_cohort(&session.dataset, &external)?;
    let policy = if test.all_members {
        OverlapPolicy::AllMembers
    } else {
        OverlapPolicy::HeldOutOnly
    };

    let progress = BarProgress::default();
    let (table, generalization) = session.pool.install(|| -> Result<_, ComparisonError> {
        let report = run_cross_validation(
            &session.dataset,
            &session.specs,
            &session.config.cross_validation,
            &progress,
        )?;
        write_cv_predictions(&session.path("cv_predictions.tsv"), &report.outcomes)?;
        let table = report.table();
        write_comparison(&session.path("comparison.tsv"), &table)?;
        let models = CohortModels::from_report(report, &session.dataset)?;
        let generalization = evaluate_generalization(&models, &external, None, policy, &progress)?;
        Ok((table, generalization))
    })?;

    write_generalization_predictions(
        &session.path("generalization_predictions.tsv"),
        &generalization,
    )?;
    write_generalization_summary(&session.path("generalization_summary.tsv"), &generalization)?;
    let by_age: Vec<(String, Vec<_>)> = generalization
        .results
        .iter()
        .filter(|result| !result.predictions.is_empty())
        .map(|result| (result.model.clone(), error_by_age(&result.predictions)))
        .collect();
    write_error_by_age(&session.path("generalization_mae_per_age.tsv"), &by_age)?;

    for result in &generalization.results {
        if result.predictions.is_empty() {
            continue;
        }
        let m = result.metrics();
        println!(
            "{:<12} generalization: n={} MAE={:.3} RMSE={:.3} R2={:.3} r={:.3}",
            result.model, m.n, m.mae, m.rmse, m.r2, m.pearson
        );
    }
    Ok(RunStatus::from_table(&table))
}

fn run_permute(
    args: CohortArgs,
    permutations: Option<usize>,
    statistic: Statistic,
    paired: bool,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let mut session = Session::prepare(&args)?;
    if let Some(permutations) = permutations {
        session.config.permutation.permutations = permutations;
    }
    validate_specs(&session.specs)?;
    check_label_test(
        &session.dataset,
        &session.config.cross_validation,
        &session.config.permutation,
    )?;
    let progress = BarProgress::default();
    let mut status = RunStatus::Complete;
    let mut distributions = Vec::new();

    session.pool.install(|| -> Result<(), ComparisonError> {
        for spec in &session.specs {
            match label_permutation_test(
                &session.dataset,
                spec,
                &session.config.cross_validation,
                statistic,
                &session.config.permutation,
                &progress,
            ) {
                Ok(distribution) => {
                    println!(
                        "{:<12} observed {statistic} = {:.4}, p = {:.4}",
                        spec.name(),
                        distribution.observed,
                        distribution.p_value()
                    );
                    distributions.push((spec.name(), statistic.to_string(), distribution));
                }
                Err(ComparisonError::Fit(e)) => {
                    log::error!("{}: every fold failed ({e}); no permutation test.", spec.name());
                    status = RunStatus::FamilyFailed;
                }
                Err(e) => return Err(e),
            }
        }

        if paired {
            let report = run_cross_validation(
                &session.dataset,
                &session.specs,
                &session.config.cross_validation,
                &progress,
            )?;
            let pooled: Vec<_> = report
                .model_names
                .iter()
                .filter_map(|model| report.pooled(model).map(|p| (model, p)))
                .collect();
            for ((name_a, a), (name_b, b)) in pooled.iter().tuple_combinations() {
                let distribution =
                    paired_model_test(name_a, a, name_b, b, &session.config.permutation)?;
                println!(
                    "{name_a} vs {name_b}: MAE difference = {:.4}, p = {:.4}",
                    distribution.observed,
                    distribution.p_value()
                );
                distributions.push((
                    format!("{name_a}-vs-{name_b}"),
                    "mae_difference".to_string(),
                    distribution,
                ));
            }
        }
        Ok(())
    })?;

    let entries: Vec<PermutationEntry<'_>> = distributions
        .iter()
        .map(|(label, statistic, distribution)| PermutationEntry {
            label: label.clone(),
            statistic: statistic.clone(),
            distribution,
        })
        .collect();
    write_permutation_runs(&session.path("permutation_runs.tsv"), &entries)?;
    write_permutation_summary(&session.path("permutation_summary.tsv"), &entries)?;
    Ok(status)
}

fn run_sample_size(
    args: CohortArgs,
    sizes: Vec<usize>,
    draws: Option<usize>,
    nested: bool,
    test_features: Option<PathBuf>,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let mut session = Session::prepare(&args)?;
    if !sizes.is_empty() {
        session.config.sample_size.sizes = sizes;
    }
    if let Some(draws) = draws {
        session.config.sample_size.repetitions = draws;
    }
    if nested {
        session.config.sample_size.policy = SubsamplePolicy::Nested;
    }
    let external = test_features
        .as_deref()
        .map(|path| load_cohort(path, &session.config, None, None))
        .transpose()?;

    let progress = BarProgress::default();
    let curves = session.pool.install(|| {
        run_sample_size_analysis(
            &session.dataset,
            &session.specs,
            &session.config.sample_size,
            &session.config.cross_validation,
            external.as_ref(),
            &progress,
        )
    })?;

    write_sample_size(&session.path("sample_size.tsv"), &curves)?;
    write_sample_size_summary(
        &session.path("sample_size_summary.tsv"),
        &curves,
        &Metric::ALL,
    )?;

    let mut status = RunStatus::Complete;
    for curve in &curves {
        if curve.points.iter().all(|point| point.metrics.is_none()) {
            log::error!("{} ({}): every draw failed.", curve.model, curve.context.as_str());
            status = RunStatus::FamilyFailed;
        }
    }
    Ok(status)
}

fn print_table(table: &ComparisonTable) {
    println!(
        "{:<12} {:>6} {:>8} {:>8} {:>8} {:>8}",
        "model", "folds", "MAE", "RMSE", "R2", "r"
    );
    for row in &table.rows {
        match &row.pooled {
            Some(m) => println!(
                "{:<12} {:>6} {:>8.3} {:>8.3} {:>8.3} {:>8.3}",
                row.model, row.folds_completed, m.mae, m.rmse, m.r2, m.pearson
            ),
            None => println!("{:<12} {:>6} {:>8}", row.model, 0, "failed"),
        }
    }
}
