use ahash::AHashSet;
use approx::assert_abs_diff_eq;
use brainage::cv::{CvPlan, run_cross_validation};
use brainage::data::Dataset;
use brainage::family::{ModelFamily, ModelSpec, SvmSpec};
use brainage::generalize::{CohortModels, OverlapPolicy, evaluate_generalization};
use brainage::metrics::error_by_age;
use brainage::progress::NoopProgress;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

fn cohort(n: usize, seed: u64, prefix: &str, site: &str) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((n, 6), |_| normal.sample(&mut rng));
    let y = Array1::from_shape_fn(n, |i| {
        60.0 + 7.0 * x[[i, 0]] + 3.0 * x[[i, 3]] + 0.5 * normal.sample(&mut rng)
    });
    let ids = (0..n).map(|i| format!("{prefix}-{i:03}")).collect();
    let names = (0..6).map(|j| format!("thickness_{j}")).collect();
    Dataset::new(ids, x, y, names)
        .unwrap()
        .with_site(vec![site.to_string(); n])
        .unwrap()
}

fn specs() -> Vec<ModelSpec> {
    vec![
        ModelSpec::Svm(SvmSpec {
            c: Some(10.0),
            ..SvmSpec::default()
        }),
        ModelSpec::defaults(ModelFamily::Gpr),
    ]
}

fn plan() -> CvPlan {
    CvPlan {
        folds: 5,
        repetitions: 1,
        seed: 17,
        retain_models: true,
        ..CvPlan::default()
    }
}

#[test]
fn identical_copy_of_the_pool_reproduces_cross_validation() {
    let pool = cohort(80, 1, "a", "scanner-1");
    let report = run_cross_validation(&pool, &specs(), &plan(), &NoopProgress).unwrap();
    let table = report.table();
    let models = CohortModels::from_report(report, &pool).unwrap();

    let copy = pool.clone();
    let result =
        evaluate_generalization(&models, &copy, None, OverlapPolicy::HeldOutOnly, &NoopProgress)
            .unwrap();
    assert!(result.failed_models.is_empty());
    for name in ["SVM", "GPR"] {
        let cv = table.get(name).unwrap().pooled.unwrap();
        let generalization = result.get(name).unwrap();
        assert!(generalization.unpredicted.is_empty());
        let metrics = generalization.metrics();
        assert_eq!(metrics.n, cv.n);
        assert_abs_diff_eq!(metrics.mae, cv.mae, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.r2, cv.r2, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.pearson, cv.pearson, epsilon = 1e-6);
    }
}

#[test]
fn models_transfer_to_an_independent_site() {
    let pool = cohort(80, 2, "a", "scanner-1");
    let external = cohort(40, 3, "b", "scanner-2");
    let report = run_cross_validation(&pool, &specs(), &plan(), &NoopProgress).unwrap();
    let models = CohortModels::from_report(report, &pool).unwrap();
    assert_eq!(models.members().len(), 10);

    let result =
        evaluate_generalization(&models, &external, None, OverlapPolicy::HeldOutOnly, &NoopProgress)
            .unwrap();
    for name in ["SVM", "GPR"] {
        let generalization = result.get(name).unwrap();
        assert_eq!(generalization.predictions.len(), 40);
        assert_eq!(generalization.members.len(), 5);
        let metrics = generalization.metrics();
        assert!(metrics.r2 > 0.9, "{name}: R2 = {}", metrics.r2);

        let bins = error_by_age(&generalization.predictions);
        let counted: usize = bins.iter().map(|bin| bin.n).sum();
        assert_eq!(counted, 40);
        let share: f64 = bins.iter().map(|bin| bin.percentage).sum();
        assert_abs_diff_eq!(share, 100.0, epsilon = 1e-9);
    }
}

#[test]
fn subject_list_restricts_the_external_cohort() {
    let pool = cohort(60, 4, "a", "scanner-1");
    let external = cohort(30, 5, "b", "scanner-2");
    let report = run_cross_validation(&pool, &specs(), &plan(), &NoopProgress).unwrap();
    let models = CohortModels::from_report(report, &pool).unwrap();

    let keep: AHashSet<String> = ["b-001", "b-004", "b-010", "b-999"]
        .into_iter()
        .map(String::from)
        .collect();
    let result = evaluate_generalization(
        &models,
        &external,
        Some(&keep),
        OverlapPolicy::HeldOutOnly,
        &NoopProgress,
    )
    .unwrap();
    let gpr = result.get("GPR").unwrap();
    assert_eq!(gpr.predictions.subject_ids, vec!["b-001", "b-004", "b-010"]);
}
