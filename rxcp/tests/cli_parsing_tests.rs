//! CLI Argument Parsing Compatibility Tests for rxcp
//!
//! These tests verify that command-line arguments are parsed correctly and keep working across
//! versions: value formats, aliases and flag combinations.

use assert_cmd::Command;

#[test]
fn test_help_runs() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

// ============================================================================
// ProgressType Argument Parsing Tests
// ============================================================================

#[test]
fn test_progress_type_auto_lowercase() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "auto", "--help"])
        .assert()
        .success();
}

#[test]
fn test_progress_type_auto_capitalized() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "Auto", "--help"])
        .assert()
        .success();
}

#[test]
fn test_progress_type_progress_bar_pascal_case() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "ProgressBar", "--help"])
        .assert()
        .success();
}

#[test]
fn test_progress_type_progress_bar_kebab_case() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "progress-bar", "--help"])
        .assert()
        .success();
}

#[test]
fn test_progress_type_text_updates_pascal_case() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "TextUpdates", "--help"])
        .assert()
        .success();
}

#[test]
fn test_progress_type_text_updates_kebab_case() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "text-updates", "--help"])
        .assert()
        .success();
}

#[test]
fn test_progress_type_invalid_value() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--progress-type", "invalid-value", "src", "dst"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value 'invalid-value'"));
}

// ============================================================================
// Transfer Options
// ============================================================================

#[test]
fn test_overwrite_policies() {
    for policy in ["always", "never", "prompt", "if-source-newer"] {
        Command::cargo_bin("rxcp")
            .unwrap()
            .args(["--overwrite", policy, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_overwrite_invalid_policy() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--overwrite", "sometimes", "src", "dst"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value 'sometimes'"));
}

#[test]
fn test_chunk_size_human_readable() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--chunk-size", "64KiB", "--help"])
        .assert()
        .success();
}

#[test]
fn test_stall_timeout_duration() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--stall-timeout", "30s", "--help"])
        .assert()
        .success();
}

#[test]
fn test_stall_timeout_invalid() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--stall-timeout", "soon", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_fail_stalled_requires_stall_timeout() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--fail-stalled", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_resume_requires_plan_dir() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--resume", "3f2b9c1e-8d4a-4b6f-9e21-7a5c0d8e4f10", "src", "dst"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("--plan-dir"));
}

#[test]
fn test_resume_rejects_malformed_job_id() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--plan-dir", "/tmp", "--resume", "not-a-job", "src", "dst"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value 'not-a-job'"));
}

#[test]
fn test_verbose_triple() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["-vvv", "--help"])
        .assert()
        .success();
}

#[test]
fn test_throttles_numeric() {
    Command::cargo_bin("rxcp")
        .unwrap()
        .args(["--transfer-throttle", "100", "--iops-throttle", "50", "--help"])
        .assert()
        .success();
}
