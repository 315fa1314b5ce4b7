//! `testforkd run` driving real `testfork-wkr` processes.

#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

use common::{assert_contains, init_test_logging};

fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .unwrap_or(manifest_dir.as_path())
        .to_path_buf()
}

/// Build `testfork-wkr` into the same target directory as `testforkd`.
fn worker_binary() -> &'static Path {
    static WORKER: OnceLock<PathBuf> = OnceLock::new();
    WORKER.get_or_init(|| {
        let bin_dir = Path::new(env!("CARGO_BIN_EXE_testforkd"))
            .parent()
            .expect("testforkd has a parent dir")
            .to_path_buf();

        let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
        let mut build = Command::new(cargo);
        build
            .args(["build", "--quiet", "-p", "testfork-wkr", "--bin", "testfork-wkr"])
            .arg("--manifest-path")
            .arg(workspace_root().join("Cargo.toml"));
        if !cfg!(debug_assertions) {
            build.arg("--release");
        }
        let status = build.status().expect("Failed to run cargo build");
        assert!(status.success(), "building testfork-wkr failed");

        let worker = bin_dir.join("testfork-wkr");
        assert!(worker.exists(), "missing {}", worker.display());
        worker
    })
}

/// Run `testforkd run` over `classes`; classes starting with `Fail` exit 1.
fn run_suite(classes: &[&str], pipelines: u32, forks: u32, report: &Path) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_testforkd"));
    cmd.env_remove("TESTFORK_CONFIG")
        .env("TESTFORK_LOG", "warn")
        .env(
            "TESTFORK_TEST_COMMAND",
            r#"sh -c 'case "$TESTFORK_CLASS" in Fail*) exit 1;; esac'"#,
        )
        .arg("run")
        .args(["--pipelines", &pipelines.to_string()])
        .args(["--forks", &forks.to_string()])
        .args(["--port", "0", "--timeout-secs", "60"])
        .arg("--worker-bin")
        .arg(worker_binary())
        .arg("--report")
        .arg(report);
    for class in classes {
        cmd.args(["--class", class]);
    }
    cmd.output().expect("Failed to run testforkd")
}

fn read_report(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_suite_completes_across_pipelines_and_forks() {
    init_test_logging();
    test_log!("TEST START: test_suite_completes_across_pipelines_and_forks");

    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.json");
    let output = run_suite(
        &["SuiteA", "SuiteB", "SuiteC", "SuiteD", "SuiteE"],
        2,
        2,
        &report_path,
    );

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "run failed: {stderr}");
    assert_contains(&String::from_utf8_lossy(&output.stdout), "5 classes: 5 passed");

    let report = read_report(&report_path);
    assert_eq!(report["outcome"], "complete");
    assert_eq!(report["totals"]["passed"], 5);
    assert_eq!(report["totals"]["unfinished"], 0);

    let pipelines = report["pipelines"].as_array().unwrap();
    assert_eq!(pipelines.len(), 2);
    for pipeline in pipelines {
        assert_eq!(pipeline["state"], "complete");
        let forks = pipeline["forks"].as_object().unwrap();
        assert_eq!(forks.len(), 2);
        assert!(forks.values().all(|state| state == "stopped"), "{pipeline}");
    }
    test_log!("TEST PASS: test_suite_completes_across_pipelines_and_forks");
}

#[test]
fn test_failing_class_fails_the_run() {
    init_test_logging();
    test_log!("TEST START: test_failing_class_fails_the_run");

    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.json");
    let output = run_suite(&["SuiteA", "FailingSuite", "SuiteC"], 1, 2, &report_path);

    assert!(!output.status.success());
    assert_contains(&String::from_utf8_lossy(&output.stdout), "fail: FailingSuite");

    let report = read_report(&report_path);
    assert_eq!(report["outcome"], "complete");
    assert_eq!(report["totals"]["passed"], 2);
    assert_eq!(report["totals"]["failed"], 1);
    assert_eq!(report["pipelines"][0]["results"]["FailingSuite"], "fail");
    test_log!("TEST PASS: test_failing_class_fails_the_run");
}
