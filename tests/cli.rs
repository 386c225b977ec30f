use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

/// 40 subjects from two sites; age follows the first two features.
fn write_cohort(path: &Path) {
    write_table(path, "sub", ["roi_a", "roi_b", "roi_c"]);
}

fn write_table(path: &Path, prefix: &str, features: [&str; 3]) {
    let mut text = format!("subject_id\tage\tsex\tsite\t{}\n", features.join("\t"));
    for i in 0..40 {
        let a = ((i * 37) % 17) as f64 / 4.0;
        let b = ((i * 11) % 13) as f64 / 3.0;
        let c = ((i * 7) % 5) as f64;
        let noise = ((i * 29) % 7) as f64 / 20.0 - 0.15;
        let age = 30.0 + 4.0 * a - 2.5 * b + noise;
        let sex = if i % 2 == 0 { "F" } else { "M" };
        let site = if i < 20 { "siteA" } else { "siteB" };
        text.push_str(&format!("{prefix}-{i:03}\t{age:.4}\t{sex}\t{site}\t{a}\t{b}\t{c}\n"));
    }
    fs::write(path, text).expect("write cohort");
}

fn brainage(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_brainage"))
        .args(args)
        .output()
        .expect("run brainage cli")
}

#[test]
fn compare_writes_tables_under_cohort_and_site() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    write_cohort(&data);
    let out = tmp.path().join("results");

    let exe = env!("CARGO_BIN_EXE_brainage");
    let status = Command::new(exe)
        .args([
            "compare",
            data.to_str().expect("path str"),
            "--cohort",
            "demo",
            "--models",
            "gpr",
            "--folds",
            "4",
            "--stratify-by",
            "sex",
            "--threads",
            "2",
            "--out",
            out.to_str().expect("path str"),
        ])
        .status()
        .expect("run brainage cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let dir = out.join("demo").join("all");
    for table in ["cv_predictions.tsv", "comparison.tsv", "mae_per_age.tsv"] {
        assert!(dir.join(table).exists(), "{table} missing");
    }
    let predictions = fs::read_to_string(dir.join("cv_predictions.tsv")).unwrap();
    assert_eq!(predictions.lines().count(), 41);
    let comparison = fs::read_to_string(dir.join("comparison.tsv")).unwrap();
    let lines: Vec<&str> = comparison.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("GPR\tevaluated\t4\t0\t40\t"), "{}", lines[1]);
}

#[test]
fn site_filter_and_subject_list_narrow_the_cohort() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    write_cohort(&data);
    let ids = tmp.path().join("ids.txt");
    let listed: Vec<String> = (20..38).map(|i| format!("sub-{i:03}")).collect();
    fs::write(&ids, format!("subject_id\n{}\n", listed.join("\n"))).unwrap();
    let out = tmp.path().join("results");

    let status = Command::new(env!("CARGO_BIN_EXE_brainage"))
        .args([
            "compare",
            data.to_str().unwrap(),
            "--cohort",
            "demo",
            "--site",
            "siteB",
            "--ids",
            ids.to_str().unwrap(),
            "--models",
            "gpr",
            "--folds",
            "3",
            "--out",
            out.to_str().unwrap(),
        ])
        .status()
        .expect("run brainage cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let predictions = fs::read_to_string(out.join("demo/siteB/cv_predictions.tsv")).unwrap();
    assert_eq!(predictions.lines().count(), 1 + 18);
    assert!(predictions.lines().skip(1).all(|line| !line.contains("sub-038")));
}

#[test]
fn permute_writes_runs_and_summary() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    write_cohort(&data);
    let out = tmp.path().join("results");

    let status = Command::new(env!("CARGO_BIN_EXE_brainage"))
        .args([
            "permute",
            data.to_str().unwrap(),
            "--cohort",
            "demo",
            "--models",
            "gpr",
            "--folds",
            "4",
            "--permutations",
            "20",
            "--out",
            out.to_str().unwrap(),
        ])
        .status()
        .expect("run brainage cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let dir = out.join("demo").join("all");
    let runs = fs::read_to_string(dir.join("permutation_runs.tsv")).unwrap();
    assert_eq!(runs.lines().count(), 21);
    let summary = fs::read_to_string(dir.join("permutation_summary.tsv")).unwrap();
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines[0], "model\tstatistic\tobserved\tpermutations\tnull_mean\tnull_sd\tp_value");
    assert!(lines[1].starts_with("GPR\tmae\t"));
}

#[test]
fn missing_input_exits_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let output = Command::new(env!("CARGO_BIN_EXE_brainage"))
        .args([
            "compare",
            tmp.path().join("absent.tsv").to_str().unwrap(),
            "--cohort",
            "demo",
            "--out",
            tmp.path().to_str().unwrap(),
        ])
        .output()
        .expect("run brainage cli");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn version_reports_the_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_brainage"))
        .arg("version")
        .output()
        .expect("run brainage cli");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with(&format!("brainage {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn generalize_writes_cohort_and_generalization_tables() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    let test = tmp.path().join("external.tsv");
    write_cohort(&data);
    write_table(&test, "ext", ["roi_a", "roi_b", "roi_c"]);
    let out = tmp.path().join("results");

    let output = brainage(&[
        "generalize",
        data.to_str().unwrap(),
        "--cohort",
        "demo",
        "--models",
        "gpr",
        "--folds",
        "4",
        "--test",
        test.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "CLI exited with {:?}", output.status);

    let dir = out.join("demo").join("all");
    for table in [
        "cv_predictions.tsv",
        "comparison.tsv",
        "generalization_predictions.tsv",
        "generalization_summary.tsv",
        "generalization_mae_per_age.tsv",
    ] {
        assert!(dir.join(table).exists(), "{table} missing");
    }
    let predictions = fs::read_to_string(dir.join("generalization_predictions.tsv")).unwrap();
    assert_eq!(predictions.lines().count(), 41);
    assert!(predictions.lines().skip(1).all(|line| line.starts_with("GPR\text-")));
    let summary = fs::read_to_string(dir.join("generalization_summary.tsv")).unwrap();
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines.len(), 1 + 1 + 4);
    assert!(lines[1].starts_with("GPR\tensemble\t40\t"), "{}", lines[1]);
    assert!(lines[1].ends_with("\tok"), "{}", lines[1]);
}

#[test]
fn mismatched_test_cohort_fails_before_cross_validation() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    let test = tmp.path().join("external.tsv");
    write_cohort(&data);
    write_table(&test, "ext", ["roi_a", "roi_b", "roi_z"]);
    let out = tmp.path().join("results");

    let output = brainage(&[
        "generalize",
        data.to_str().unwrap(),
        "--cohort",
        "demo",
        "--models",
        "gpr",
        "--folds",
        "4",
        "--test",
        test.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
    let dir = out.join("demo").join("all");
    assert!(!dir.join("cv_predictions.tsv").exists());
    assert!(!dir.join("comparison.tsv").exists());
}

#[test]
fn test_subject_list_below_two_subjects_fails_before_cross_validation() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    let test = tmp.path().join("external.tsv");
    write_cohort(&data);
    write_table(&test, "ext", ["roi_a", "roi_b", "roi_c"]);
    let ids = tmp.path().join("test_ids.txt");
    fs::write(&ids, "ext-003\nnot-a-subject\n").unwrap();
    let out = tmp.path().join("results");

    let output = brainage(&[
        "generalize",
        data.to_str().unwrap(),
        "--cohort",
        "demo",
        "--models",
        "gpr",
        "--test",
        test.to_str().unwrap(),
        "--test-ids",
        ids.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!out.join("demo/all/cv_predictions.tsv").exists());
}

#[test]
fn sample_size_writes_training_and_cross_validation_curves() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    write_cohort(&data);
    let out = tmp.path().join("results");

    let output = brainage(&[
        "sample-size",
        data.to_str().unwrap(),
        "--cohort",
        "demo",
        "--models",
        "gpr",
        "--folds",
        "4",
        "--sizes",
        "12,24",
        "--draws",
        "2",
        "--out",
        out.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "CLI exited with {:?}", output.status);

    let dir = out.join("demo").join("all");
    let points = fs::read_to_string(dir.join("sample_size.tsv")).unwrap();
    let lines: Vec<&str> = points.lines().collect();
    assert_eq!(
        lines[0],
        "model\tcontext\tsize\trepetition\tn\tmae\trmse\tr2\tpearson\tage_error_corr\tstatus"
    );
    assert_eq!(lines.len(), 1 + 2 * 2 * 2);
    let training: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| l.starts_with("GPR\ttraining\t"))
        .collect();
    assert_eq!(training.len(), 4);
    assert!(training.iter().all(|l| l.ends_with("\tok")));
    assert!(lines.iter().any(|l| l.starts_with("GPR\tcross_validation\t24\t1\t24\t")));

    let summary = fs::read_to_string(dir.join("sample_size_summary.tsv")).unwrap();
    assert_eq!(summary.lines().count(), 1 + 2 * 5 * 2);
    assert!(summary.lines().any(|l| l.starts_with("GPR\ttraining\tmae\t12\t")));
}

#[test]
fn family_failing_on_every_fold_exits_with_status_two() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    write_cohort(&data);
    let config = tmp.path().join("experiment.toml");
    fs::write(
        &config,
        "[[models]]\nfamily = \"rvm\"\nmax_iterations = 1\ntolerance = 1e-12\n",
    )
    .unwrap();
    let out = tmp.path().join("results");

    let output = brainage(&[
        "compare",
        data.to_str().unwrap(),
        "--cohort",
        "demo",
        "--models",
        "rvm",
        "--folds",
        "4",
        "--config",
        config.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(2));

    let comparison = fs::read_to_string(out.join("demo/all/comparison.tsv")).unwrap();
    let lines: Vec<&str> = comparison.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("RVM\tfailed\t0\t4\t"), "{}", lines[1]);
    let predictions = fs::read_to_string(out.join("demo/all/cv_predictions.tsv")).unwrap();
    assert!(predictions.lines().skip(1).all(|line| line.ends_with("\tfailed")));
}

#[test]
fn invalid_model_in_a_permutation_batch_is_rejected_up_front() {
    let tmp = tempdir().expect("temporary directory");
    let data = tmp.path().join("cohort.tsv");
    write_cohort(&data);
    let config = tmp.path().join("experiment.toml");
    fs::write(
        &config,
        "[[models]]\nfamily = \"gpr\"\n\n[[models]]\nfamily = \"svm\"\nc_grid = []\n",
    )
    .unwrap();
    let out = tmp.path().join("results");

    let output = brainage(&[
        "permute",
        data.to_str().unwrap(),
        "--cohort",
        "demo",
        "--folds",
        "4",
        "--permutations",
        "5",
        "--config",
        config.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:") && stderr.contains("SVM"), "{stderr}");
    assert!(!out.join("demo/all/permutation_runs.tsv").exists());
}

#[test]
fn no_subcommand_prints_help_and_succeeds() {
    let output = brainage(&[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:") && stdout.contains("sample-size"), "{stdout}");
}
