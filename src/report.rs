//! Text, JSON, and CSV renderings of finished runs and sweeps.

use std::fmt::Write as _;

use crate::error::LineError;
use crate::sim::{FailureSweepRow, RunReport, WorkerSweepRow};
use crate::types::{WorkerRole, WorkerState};

fn role_name(role: WorkerRole) -> &'static str {
    match role {
        WorkerRole::Primary => "primary",
        WorkerRole::Standby => "standby",
    }
}

fn state_name(state: WorkerState) -> &'static str {
    match state {
        WorkerState::Idle => "idle",
        WorkerState::Active => "active",
        WorkerState::Processing => "processing",
        WorkerState::Returning => "returning",
        WorkerState::Disabled => "disabled",
        WorkerState::Failed => "failed",
        WorkerState::Standby => "standby",
    }
}

fn or_na(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string())
}

/// `RUN SUMMARY` block of `key=value` lines.
pub fn summary(report: &RunReport, per_batch: bool) -> String {
    let stats = &report.stats;
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "RUN SUMMARY");
    let _ = writeln!(
        out,
        "primaries={} standbys={}",
        report.params.primary_workers, report.params.standby_workers
    );
    let _ = writeln!(out, "batches={}", stats.batches_seen);
    let _ = writeln!(out, "items={}", stats.items_seen);
    let _ = writeln!(out, "completed={}", stats.items_completed);
    let _ = writeln!(out, "missed={}", stats.items_missed);
    let _ = writeln!(out, "efficiency={:.2}", stats.efficiency());
    let _ = writeln!(out, "failures={}", stats.failures);
    let _ = writeln!(out, "standby_activations={}", stats.standby_activations);
    let _ = writeln!(out, "uncovered_stations={}", stats.uncovered_stations);
    let _ = writeln!(out, "placement_warnings={}", report.placement_warnings);
    for worker in &report.workers {
        let _ = write!(
            out,
            "worker[{}]={} ({}, {}",
            worker.id,
            worker.completed,
            role_name(worker.role),
            state_name(worker.state)
        );
        if let Some(failed) = worker.covering {
            let _ = write!(out, ", covering={failed}");
        }
        let _ = writeln!(out, ")");
    }
    if per_batch {
        for batch in &stats.batches {
            let _ = writeln!(out, "batch {}: {}/{}", batch.seq, batch.completed, batch.total);
        }
    }
    out
}

pub fn json(report: &RunReport) -> Result<String, LineError> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn worker_sweep_csv(rows: &[WorkerSweepRow]) -> String {
    let mut out = String::from(
        "primaries,avg_efficiency,min_efficiency,max_efficiency,avg_missed_per_batch,optimal,elapsed_ms,cpu_user_s,cpu_sys_s\n",
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{},{:.2},{:.2},{:.2},{:.2},{},{:.2},{},{}",
            row.primaries,
            row.efficiency.avg,
            row.efficiency.min,
            row.efficiency.max,
            row.efficiency.missed_per_batch,
            row.optimal,
            row.elapsed_ms,
            or_na(row.cpu_user_s),
            or_na(row.cpu_sys_s)
        );
    }
    out
}

pub fn failure_sweep_csv(rows: &[FailureSweepRow]) -> String {
    let mut out = String::from(
        "failure_probability,primaries_without_standby,efficiency_without_standby,standbys,primaries_with_standby,efficiency_with_standby,elapsed_ms,cpu_user_s,cpu_sys_s\n",
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:.2},{},{:.2},{},{},{:.2},{:.2},{},{}",
            row.failure_probability,
            row.primaries_without_standby,
            row.efficiency_without_standby,
            row.standbys,
            row.primaries_with_standby,
            row.efficiency_with_standby,
            row.elapsed_ms,
            or_na(row.cpu_user_s),
            or_na(row.cpu_sys_s)
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemParameters;
    use crate::sim::Efficiency;
    use crate::types::{BatchOutcome, RunStatistics, WorkerStatus};

    fn report() -> RunReport {
        let mut stats = RunStatistics::with_workers(2);
        stats.batches_seen = 2;
        stats.items_seen = 20;
        stats.items_completed = 15;
        stats.items_missed = 5;
        stats.failures = 1;
        stats.standby_activations = 1;
        stats.batches = vec![
            BatchOutcome {
                seq: 0,
                total: 10,
                completed: 10,
                missed: 0,
            },
            BatchOutcome {
                seq: 1,
                total: 10,
                completed: 5,
                missed: 5,
            },
        ];
        RunReport {
            params: SystemParameters::default(),
            stats,
            workers: vec![
                WorkerStatus {
                    id: 0,
                    role: WorkerRole::Primary,
                    state: WorkerState::Failed,
                    completed: 9,
                    covering: None,
                },
                WorkerStatus {
                    id: 1,
                    role: WorkerRole::Standby,
                    state: WorkerState::Standby,
                    completed: 6,
                    covering: Some(0),
                },
            ],
            placement_warnings: 0,
            status_updates: 4,
            elapsed_ms: 12.0,
        }
    }

    #[test]
    fn summary_lists_counters_and_substitutions() {
        let text = summary(&report(), false);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "RUN SUMMARY");
        assert!(lines.contains(&"completed=15"));
        assert!(lines.contains(&"missed=5"));
        assert!(lines.contains(&"efficiency=75.00"));
        assert!(lines.contains(&"worker[0]=9 (primary, failed)"));
        assert!(lines.contains(&"worker[1]=6 (standby, standby, covering=0)"));
        assert!(!text.contains("batch 0:"));
    }

    #[test]
    fn per_batch_lines_are_optional() {
        let text = summary(&report(), true);
        assert!(text.contains("batch 0: 10/10\n"));
        assert!(text.contains("batch 1: 5/10\n"));
    }

    #[test]
    fn json_report_is_parseable() {
        let raw = json(&report()).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["stats"]["items_completed"], 15);
        assert_eq!(value["workers"][1]["covering"], 0);
    }

    #[test]
    fn sweep_csv_marks_missing_cpu_times() {
        let rows = vec![WorkerSweepRow {
            primaries: 3,
            efficiency: Efficiency {
                avg: 80.0,
                min: 70.0,
                max: 90.0,
                missed_per_batch: 2.5,
            },
            optimal: false,
            elapsed_ms: 1.0,
            cpu_user_s: None,
            cpu_sys_s: Some(0.5),
        }];
        let csv = worker_sweep_csv(&rows);
        let mut lines = csv.lines();
        assert!(lines.next().expect("header").starts_with("primaries,"));
        assert_eq!(
            lines.next().expect("row"),
            "3,80.00,70.00,90.00,2.50,false,1.00,NA,0.5000"
        );
    }

    #[test]
    fn failure_csv_has_one_row_per_probability() {
        let rows: Vec<_> = [0.0, 0.1]
            .iter()
            .map(|&p| FailureSweepRow {
                failure_probability: p,
                primaries_without_standby: 6,
                efficiency_without_standby: 99.6,
                standbys: 1,
                primaries_with_standby: 6,
                efficiency_with_standby: 99.8,
                elapsed_ms: 3.0,
                cpu_user_s: None,
                cpu_sys_s: None,
            })
            .collect();
        let csv = failure_sweep_csv(&rows);
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.contains("\n0.10,6,99.60,1,6,99.80,3.00,NA,NA\n"));
    }
}
