//! CLI surface behavior: exit codes, formats, and the pypi staging path.

use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn verdict_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("verdict").unwrap();
    // Keep host machines' model caches out of the tests.
    cmd.env_remove("VERDICT_MODEL_PATH");
    cmd
}

/// A model cache directory that flags process management activity.
fn model_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("decision_layer.yaml"),
        "bias: -4.0\nweights:\n  process_management: 6.0\n  STRING_BASH: 2.5\n",
    )
    .unwrap();
    fs::write(dir.path().join("REVISION"), "41f0c0de90ab12cd\n").unwrap();
    dir
}

#[test]
fn clean_scan_exits_zero() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("ok.py"), "x = 1\n").unwrap();
    let model = model_dir();

    verdict_cmd()
        .env("VERDICT_MODEL_PATH", model.path())
        .args(["scan", dir.path().to_str().unwrap(), "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn malicious_scan_exits_one() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("evil.py"), "import os\nos.system(\"rm -rf /\")\n").unwrap();
    let model = model_dir();

    verdict_cmd()
        .env("VERDICT_MODEL_PATH", model.path())
        .args(["scan", dir.path().to_str().unwrap(), "--quiet"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("malicious"));
}

#[test]
fn missing_model_reports_inconclusive_but_still_succeeds() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("evil.py"), "import os\nos.system(\"rm -rf /\")\n").unwrap();

    verdict_cmd()
        .args(["scan", dir.path().to_str().unwrap(), "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("inconclusive"));
}

#[test]
fn nonexistent_path_exits_two() {
    verdict_cmd()
        .args(["scan", "/tmp/verdict-no-such-path-98765", "--quiet"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn json_format_emits_the_report_schema() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    fs::write(dir.path().join("b.txt"), "skip me\n").unwrap();

    let output = verdict_cmd()
        .args(["scan", dir.path().to_str().unwrap(), "--format", "json", "--quiet"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed["statistics"]["total_files"], 2);
    assert_eq!(parsed["statistics"]["skipped_files"], 1);
    assert!(parsed["version"].as_str().unwrap().contains('+'));
    assert!(parsed["start"].as_str().is_some());
}

#[test]
fn save_writes_the_report_to_a_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    let out_file = dir.path().join("report.yaml");

    verdict_cmd()
        .args([
            "scan",
            dir.path().to_str().unwrap(),
            "--format",
            "yaml",
            "--save",
            out_file.to_str().unwrap(),
            "--quiet",
        ])
        .assert()
        .success();

    let saved = fs::read_to_string(&out_file).unwrap();
    assert!(saved.contains("verdict:"));
}

#[test]
fn extension_filter_narrows_the_scan() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    fs::write(dir.path().join("b.js"), "const y = 2;\n").unwrap();

    let output = verdict_cmd()
        .args([
            "scan",
            dir.path().to_str().unwrap(),
            "--extensions",
            "py",
            "--format",
            "json",
            "--quiet",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed["statistics"]["processed_files"], 1);
    assert_eq!(parsed["statistics"]["skipped_files"], 1);
}

#[test]
fn pypi_without_a_folder_is_a_usage_error() {
    verdict_cmd()
        .args(["pypi", "requests", "--quiet"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--folder"));
}

#[test]
fn pypi_scans_a_staged_package_folder() {
    let staged = TempDir::new().unwrap();
    let package = staged.path().join("demo-0.1.0");
    fs::create_dir_all(&package).unwrap();
    fs::write(package.join("setup.py"), "from setuptools import setup\nsetup()\n").unwrap();

    verdict_cmd()
        .args([
            "pypi",
            "demo",
            "--folder",
            staged.path().to_str().unwrap(),
            "--format",
            "json",
            "--quiet",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("setup.py"));
}

#[test]
fn csv_export_lists_objects_with_hashes() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("m.py"), "def f():\n    return 1\n").unwrap();

    let output = verdict_cmd()
        .args(["scan", dir.path().to_str().unwrap(), "--format", "csv", "--quiet"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let text = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("file_hash,language,object_name"));
    // Module plus one function object.
    assert_eq!(lines.len(), 3);
    assert!(text.contains(",python,f,"));
}
