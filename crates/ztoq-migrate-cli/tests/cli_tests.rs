//! CLI integration tests for ztoq-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes for error conditions, and a full offline run.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;

/// Get a command for the ztoq-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("ztoq-migrate").unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("transform"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("load"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--project-key"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--max-workers"))
        .stdout(predicate::str::contains("--attachments-dir"));
}

#[test]
fn test_cleanup_subcommand_help() {
    cmd()
        .args(["cleanup", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--run-id"))
        .stdout(predicate::str::contains("--purge"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ztoq-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_output_json_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_log_format_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"));
}

#[test]
fn test_verbosity_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

// =============================================================================
// Argument Validation Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_run_requires_project_key() {
    cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--project-key"));
}

#[test]
fn test_status_requires_run_or_project() {
    cmd()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--run-id"));
}

#[test]
fn test_status_rejects_both_selectors() {
    cmd()
        .args(["status", "--run-id", "a", "--project-key", "DEMO"])
        .assert()
        .failure();
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "status", "--run-id", "x"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status", "--run-id", "x"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_settings_exit_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "migration:").unwrap();
    writeln!(file, "  batch_size: 0").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status", "--run-id", "x"])
        .assert()
        .code(1);
}

#[test]
fn test_run_without_export_dir_exits_with_code_1() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), None);

    cmd()
        .args(["--config", config.as_str(), "run", "--project-key", "DEMO"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("source.export_dir"));
}

#[test]
fn test_unknown_run_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), Some(dir.path()));

    cmd()
        .args(["--config", config.as_str(), "status", "--run-id", "missing-run"])
        .assert()
        .code(2);

    cmd()
        .args(["--config", config.as_str(), "status", "--project-key", "NOPE"])
        .assert()
        .code(2);
}

// =============================================================================
// Offline Run Tests
// =============================================================================

fn write_config(root: &Path, export_dir: Option<&Path>) -> String {
    let path = root.join("config.yaml");
    let mut yaml = format!(
        "migration:\n  batch_size: 2\n  max_workers: 2\nstate:\n  backend: file\n  dir: {}\ntarget:\n  output_dir: {}\n",
        root.join("state").display(),
        root.join("out").display()
    );
    if let Some(export) = export_dir {
        yaml.push_str(&format!("source:\n  export_dir: {}\n", export.display()));
    }
    std::fs::write(&path, yaml).unwrap();
    path.to_str().unwrap().to_string()
}

fn write_export(root: &Path) -> std::path::PathBuf {
    let project = root.join("export").join("DEMO");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(
        project.join("folder.json"),
        json!([
            {"id": 1, "name": "Root"},
            {"id": 2, "name": "Auth", "parentId": 1}
        ])
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        project.join("test_case.json"),
        json!([
            {"id": 10, "key": "DEMO-T10", "name": "Login", "folderId": 2},
            {"id": 11, "key": "DEMO-T11", "name": "", "folderId": 2},
            {"id": 12, "key": "DEMO-T12", "name": "Logout", "folderId": 1}
        ])
        .to_string(),
    )
    .unwrap();
    root.join("export")
}

fn json_stdout(output: &[u8]) -> Value {
    serde_json::from_slice(output).unwrap()
}

#[test]
fn test_offline_run_status_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let export = write_export(dir.path());
    let config = write_config(dir.path(), Some(&export));

    let output = cmd()
        .args([
            "--config",
            config.as_str(),
            "--output-json",
            "run",
            "--project-key",
            "DEMO",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let snapshot = json_stdout(&output);
    assert_eq!(snapshot["run"]["status"], "completed");
    assert_eq!(snapshot["records_committed"], 4);
    assert_eq!(snapshot["records_failed"], 1);
    assert_eq!(snapshot["failures"][0]["record_id"], 11);
    assert_eq!(snapshot["failures"][0]["cause"], "validation");
    let run_id = snapshot["run"]["run_id"].as_str().unwrap().to_string();

    let cases = std::fs::read_to_string(dir.path().join("out/DEMO/test_case.jsonl")).unwrap();
    assert_eq!(cases.lines().count(), 2);
    let folders = std::fs::read_to_string(dir.path().join("out/DEMO/folder.jsonl")).unwrap();
    assert!(folders.contains("/Root/Auth"));

    // A second process sees the persisted run.
    let output = cmd()
        .args([
            "--config",
            config.as_str(),
            "--output-json",
            "status",
            "--project-key",
            "DEMO",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(json_stdout(&output)["run"]["run_id"], run_id.as_str());

    // Resuming a completed run is a no-op.
    cmd()
        .args(["--config", config.as_str(), "resume", "--run-id", run_id.as_str()])
        .assert()
        .success();
    let cases = std::fs::read_to_string(dir.path().join("out/DEMO/test_case.jsonl")).unwrap();
    assert_eq!(cases.lines().count(), 2);

    cmd()
        .args([
            "--config",
            config.as_str(),
            "cleanup",
            "--run-id",
            run_id.as_str(),
            "--purge",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run deleted: true"));

    cmd()
        .args(["--config", config.as_str(), "status", "--run-id", run_id.as_str()])
        .assert()
        .code(2);
}

#[test]
fn test_phase_commands_drive_a_run_step_by_step() {
    let dir = tempfile::tempdir().unwrap();
    let export = write_export(dir.path());
    let config = write_config(dir.path(), Some(&export));

    // Fail the first run during extract with an unreadable export.
    std::fs::write(export.join("DEMO/test_case.json"), "{\"not\": \"an array\"}").unwrap();
    cmd()
        .args(["--config", config.as_str(), "run", "--project-key", "DEMO"])
        .assert()
        .code(4);

    let output = cmd()
        .args([
            "--config",
            config.as_str(),
            "--output-json",
            "status",
            "--project-key",
            "DEMO",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let snapshot = json_stdout(&output);
    assert_eq!(snapshot["run"]["status"], "failed");
    assert_eq!(snapshot["last_error"]["phase"], "extract");
    let run_id = snapshot["run"]["run_id"].as_str().unwrap().to_string();

    write_export(dir.path());
    let output = cmd()
        .args([
            "--config",
            config.as_str(),
            "--output-json",
            "validate",
            "--run-id",
            run_id.as_str(),
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let snapshot = json_stdout(&output);
    assert_eq!(snapshot["run"]["status"], "paused");
    assert_eq!(snapshot["run"]["phase"], "load");
    assert!(!dir.path().join("out/DEMO/test_case.jsonl").exists());

    cmd()
        .args(["--config", config.as_str(), "load", "--run-id", run_id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: completed"));
    let cases = std::fs::read_to_string(dir.path().join("out/DEMO/test_case.jsonl")).unwrap();
    assert_eq!(cases.lines().count(), 2);
}
