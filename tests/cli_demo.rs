//! CLI integration tests for the run and sweep modes.

use std::io::Write;
use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_labeling_line"))
}

fn value<'a>(stdout: &'a str, key: &str) -> &'a str {
    let prefix = format!("{key}=");
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .unwrap_or_else(|| panic!("{key} line missing"))
}

#[test]
fn run_prints_conserved_summary() {
    let output = bin()
        .args(["run", "--batches", "3", "--time-scale", "0.002", "--seed", "5", "--per-batch"])
        .output()
        .expect("failed to run binary");
    assert!(
        output.status.success(),
        "run exited with non-zero status: {:?}",
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("RUN SUMMARY"), "summary header missing");
    assert_eq!(value(&stdout, "batches"), "3");

    let items: u64 = value(&stdout, "items").parse().expect("items");
    let completed: u64 = value(&stdout, "completed").parse().expect("completed");
    let missed: u64 = value(&stdout, "missed").parse().expect("missed");
    assert_eq!(completed + missed, items);

    // Default roster: four primaries and one standby.
    assert_eq!(stdout.lines().filter(|line| line.starts_with("worker[")).count(), 5);
    assert_eq!(stdout.lines().filter(|line| line.starts_with("batch ")).count(), 3);
}

#[test]
fn json_output_parses() {
    let output = bin()
        .args(["run", "-b", "1", "--time-scale", "0.002", "--json"])
        .output()
        .expect("failed to run binary");
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is one JSON document");
    assert_eq!(report["stats"]["batches_seen"], 1);
}

#[test]
fn config_file_values_apply_and_cli_wins() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        "[line]\nprimary_workers = 2\nstandby_workers = 0\ntime_scale = 0.002\n\n[run]\nbatches = 2"
    )
    .expect("write config");

    let output = bin()
        .arg("--config")
        .arg(file.path())
        .args(["run", "--batches", "1"])
        .output()
        .expect("failed to run binary");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(value(&stdout, "primaries"), "2 standbys=0");
    assert_eq!(value(&stdout, "batches"), "1");
}

#[test]
fn invalid_parameters_exit_with_failure() {
    let output = bin()
        .args(["run", "--failure-probability", "2.0"])
        .output()
        .expect("failed to run binary");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failure_probability"), "stderr: {stderr}");
}

#[test]
fn missing_config_file_exits_with_failure() {
    let output = bin()
        .args(["--config", "/nonexistent/line.toml", "run"])
        .output()
        .expect("failed to run binary");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let output = bin()
        .args(["run", "--belt-speed", "3"])
        .output()
        .expect("failed to run binary");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn worker_sweep_prints_csv() {
    let output = bin()
        .args([
            "sweep",
            "workers",
            "--batches",
            "1",
            "--runs",
            "1",
            "--time-scale",
            "0.001",
            "--seed",
            "3",
        ])
        .output()
        .expect("failed to run binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    assert!(lines.next().expect("header").starts_with("primaries,avg_efficiency"));
    let first = lines.next().expect("first row");
    assert!(first.starts_with("1,"), "row: {first}");
}
