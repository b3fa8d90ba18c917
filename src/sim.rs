//! Run orchestration: thread setup and teardown for one line run, the
//! demo run fed by a vision thread, and the statistical sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{LineConfig, ParameterOverrides, SystemParameters};
use crate::error::LineError;
use crate::feeder::ConveyorFeeder;
use crate::generator::{GeneratedSource, ItemGenerator};
use crate::shared_state::SharedState;
use crate::supervisor::FailureSupervisor;
use crate::transport::{BatchSource, ChannelSource, Envelope, NullSink, StatusSink};
use crate::types::{MAX_QUEUED_BATCHES, RunStatistics, WorkerStatus};
use crate::worker::WorkerTask;

/// Worker-count ceiling for the roster sweep.
const SWEEP_MAX_WORKERS: usize = 15;
/// Worker-count ceiling for each search in the failure sweep.
const FAILURE_SWEEP_MAX_WORKERS: usize = 12;
const WORKER_SWEEP_TARGET: f64 = 99.9;
const FAILURE_SWEEP_TARGET: f64 = 99.5;
pub const FAILURE_PROBABILITIES: [f64; 7] = [0.0, 0.05, 0.10, 0.15, 0.20, 0.25, 0.30];
/// Keeps the vision generator's draws apart from the failure draws.
const VISION_STREAM: u64 = 0x5EED_F00D;

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain old data; all-zero is a valid value.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// CPU seconds spent between two snapshots.
fn cpu_delta(start: Option<(f64, f64)>) -> (Option<f64>, Option<f64>) {
    match (start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    }
}

/// Everything a reporting sink needs once a run has finished.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub params: SystemParameters,
    pub stats: RunStatistics,
    pub workers: Vec<WorkerStatus>,
    pub placement_warnings: u64,
    pub status_updates: u64,
    pub elapsed_ms: f64,
}

fn spawn_named<T, F>(name: String, body: F) -> Result<JoinHandle<T>, LineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| LineError::Spawn { name, source })
}

fn join_named<T>(name: &str, handle: JoinHandle<T>) -> Result<T, LineError> {
    handle.join().map_err(|_| LineError::ThreadPanicked {
        name: name.to_string(),
    })
}

/// Run the line over `source` until it closes or `cancel` is raised.
///
/// One thread per worker unit plus the conveyor thread; all are joined
/// before returning.
pub fn run_line(
    params: SystemParameters,
    source: Box<dyn BatchSource>,
    cancel: Arc<AtomicBool>,
    status: Arc<dyn StatusSink>,
) -> Result<RunReport, LineError> {
    let start = Instant::now();
    let shared = Arc::new(SharedState::new(params.clone()));

    let mut workers = Vec::with_capacity(params.total_workers());
    for id in 0..params.total_workers() {
        let task = WorkerTask::new(
            id,
            Arc::clone(&shared),
            FailureSupervisor::new(params.failure_probability, params.seed, id as u64),
            Arc::clone(&status),
        );
        let name = format!("worker-{id}");
        match spawn_named(name.clone(), move || task.run()) {
            Ok(handle) => workers.push((name, handle)),
            Err(err) => {
                shared.request_shutdown();
                for (name, handle) in workers {
                    let _ = join_named(&name, handle);
                }
                return Err(err);
            }
        }
    }

    let feeder = ConveyorFeeder::new(Arc::clone(&shared), source, cancel);
    let conveyor = spawn_named("conveyor".to_string(), move || feeder.run());
    let fed = match conveyor {
        Ok(handle) => join_named("conveyor", handle),
        Err(err) => Err(err),
    };
    // Workers must be released even if the conveyor never ran.
    shared.request_shutdown();

    let mut first_panic = None;
    for (name, handle) in workers {
        if let Err(err) = join_named(&name, handle) {
            first_panic.get_or_insert(err);
        }
    }
    let batches = fed??;
    if let Some(err) = first_panic {
        return Err(err);
    }

    let stats = shared.statistics();
    info!(
        batches,
        completed = stats.items_completed,
        missed = stats.items_missed,
        failures = stats.failures,
        "run finished"
    );
    Ok(RunReport {
        params,
        stats,
        workers: shared.snapshot(),
        placement_warnings: 0,
        status_updates: 0,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

/// Full run: a vision thread generates `config.batches` batches into a
/// bounded channel, and a status thread drains worker snapshots.
pub fn run_demo(config: &LineConfig, cancel: Arc<AtomicBool>) -> Result<RunReport, LineError> {
    let params = config.params.clone();
    let (tx, source) = ChannelSource::bounded(MAX_QUEUED_BATCHES);

    let vision = {
        let cancel = Arc::clone(&cancel);
        let batches = config.batches;
        let params = params.clone();
        spawn_named("vision".to_string(), move || {
            let mut generator = ItemGenerator::new(params.seed.map(|seed| seed ^ VISION_STREAM));
            for seq in 0..batches as u64 {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let batch = match generator.generate(
                    seq,
                    params.min_items,
                    params.max_items,
                    params.batch_size,
                ) {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(batch = seq, error = %err, "vision stage dropped batch");
                        continue;
                    }
                };
                // Blocks while the queue is full; fails once the line is gone.
                if tx.send(Envelope::Batch(batch)).is_err() {
                    break;
                }
            }
            let _ = tx.send(Envelope::Shutdown);
            generator.placement_warnings()
        })?
    };

    let (status_tx, status_rx) = mpsc::channel::<Envelope>();
    let monitor = spawn_named("status".to_string(), move || {
        let mut updates = 0u64;
        for envelope in status_rx {
            let Envelope::Status(status) = envelope else {
                continue;
            };
            updates += 1;
            debug!(
                worker = status.id,
                state = ?status.state,
                completed = status.completed,
                "status snapshot"
            );
        }
        updates
    })?;

    let sink: Arc<dyn StatusSink> = Arc::new(status_tx);
    let run = run_line(params, Box::new(source), cancel, sink);

    let placement_warnings = join_named("vision", vision)?;
    let status_updates = join_named("status", monitor)?;
    let mut report = run?;
    report.placement_warnings = placement_warnings;
    report.status_updates = status_updates;
    Ok(report)
}

/// Efficiency figures over repeated runs of one configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Efficiency {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub missed_per_batch: f64,
}

/// One row of the roster sweep.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerSweepRow {
    pub primaries: usize,
    pub efficiency: Efficiency,
    pub optimal: bool,
    pub elapsed_ms: f64,
    pub cpu_user_s: Option<f64>,
    pub cpu_sys_s: Option<f64>,
}

/// One row of the failure sweep.
#[derive(Clone, Debug, Serialize)]
pub struct FailureSweepRow {
    pub failure_probability: f64,
    pub primaries_without_standby: usize,
    pub efficiency_without_standby: f64,
    pub standbys: usize,
    pub primaries_with_standby: usize,
    pub efficiency_with_standby: f64,
    pub elapsed_ms: f64,
    pub cpu_user_s: Option<f64>,
    pub cpu_sys_s: Option<f64>,
}

/// Shared knobs for both sweeps.
#[derive(Clone, Debug)]
pub struct SweepPlan {
    pub base: ParameterOverrides,
    pub batches: usize,
    pub runs: usize,
    pub cancel: Arc<AtomicBool>,
}

impl SweepPlan {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn params(
        &self,
        primaries: usize,
        standbys: usize,
        probability: f64,
    ) -> Result<SystemParameters, LineError> {
        ParameterOverrides {
            primary_workers: Some(primaries),
            standby_workers: Some(standbys),
            failure_probability: Some(probability),
            // Spacing follows the roster size.
            worker_spacing: None,
            ..self.base.clone()
        }
        .resolve()
    }

    /// Average the efficiency of `runs` independent runs.
    fn evaluate(&self, params: &SystemParameters) -> Result<Efficiency, LineError> {
        let mut efficiencies = Vec::with_capacity(self.runs);
        let mut missed = 0u64;
        let mut batches = 0u64;
        for run in 0..self.runs.max(1) {
            let mut params = params.clone();
            params.seed = params.seed.map(|seed| seed.wrapping_add(run as u64));
            let source = GeneratedSource::new(
                ItemGenerator::new(params.seed.map(|seed| seed ^ VISION_STREAM)),
                params.min_items,
                params.max_items,
                params.batch_size,
                self.batches,
            );
            let report = run_line(
                params,
                Box::new(source),
                Arc::clone(&self.cancel),
                Arc::new(NullSink),
            )?;
            efficiencies.push(report.stats.efficiency());
            missed += report.stats.items_missed;
            batches += report.stats.batches_seen;
            if self.cancelled() {
                break;
            }
        }
        let avg = efficiencies.iter().sum::<f64>() / efficiencies.len() as f64;
        Ok(Efficiency {
            avg,
            min: efficiencies.iter().copied().fold(f64::INFINITY, f64::min),
            max: efficiencies.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            missed_per_batch: if batches == 0 {
                0.0
            } else {
                missed as f64 / batches as f64
            },
        })
    }

    /// Smallest primary count reaching `target`, or the best seen.
    fn search_primaries(
        &self,
        standbys: usize,
        probability: f64,
    ) -> Result<(usize, f64), LineError> {
        let mut best = (1, f64::NEG_INFINITY);
        for primaries in 1..=FAILURE_SWEEP_MAX_WORKERS {
            if self.cancelled() {
                break;
            }
            let params = self.params(primaries, standbys, probability)?;
            let efficiency = self.evaluate(&params)?.avg;
            debug!(primaries, standbys, probability, efficiency, "failure sweep point");
            if efficiency > best.1 {
                best = (primaries, efficiency);
            }
            if efficiency >= FAILURE_SWEEP_TARGET {
                return Ok((primaries, efficiency));
            }
        }
        Ok(best)
    }
}

/// Efficiency per primary count with no standbys and no failures, stopping
/// at the first count that reaches the target.
pub fn sweep_workers(plan: &SweepPlan) -> Result<Vec<WorkerSweepRow>, LineError> {
    let reference = plan.params(1, 0, 0.0)?;
    let mut rows = Vec::new();
    for primaries in 1..=SWEEP_MAX_WORKERS {
        if reference.line_length / (primaries as f64) < reference.batch_size || plan.cancelled() {
            break;
        }
        let params = plan.params(primaries, 0, 0.0)?;
        let cpu_start = cpu_times_seconds();
        let start = Instant::now();
        let efficiency = plan.evaluate(&params)?;
        let (cpu_user_s, cpu_sys_s) = cpu_delta(cpu_start);
        let optimal = efficiency.avg >= WORKER_SWEEP_TARGET;
        info!(primaries, efficiency = efficiency.avg, optimal, "worker sweep point");
        rows.push(WorkerSweepRow {
            primaries,
            efficiency,
            optimal,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            cpu_user_s,
            cpu_sys_s,
        });
        if optimal {
            break;
        }
    }
    Ok(rows)
}

/// For each probability, the primaries needed without standbys, then the
/// primaries needed with `floor(primaries * p) + 1` standbys.
pub fn sweep_failures(
    plan: &SweepPlan,
    probabilities: &[f64],
) -> Result<Vec<FailureSweepRow>, LineError> {
    let mut rows = Vec::new();
    for &probability in probabilities {
        if plan.cancelled() {
            break;
        }
        let cpu_start = cpu_times_seconds();
        let start = Instant::now();
        let (without, efficiency_without) = plan.search_primaries(0, probability)?;
        let standbys = (without as f64 * probability).floor() as usize + 1;
        let (covered, efficiency_with) = plan.search_primaries(standbys, probability)?;
        let (cpu_user_s, cpu_sys_s) = cpu_delta(cpu_start);
        info!(probability, without, standbys, covered, "failure sweep row");
        rows.push(FailureSweepRow {
            failure_probability: probability,
            primaries_without_standby: without,
            efficiency_without_standby: efficiency_without,
            standbys,
            primaries_with_standby: covered,
            efficiency_with_standby: efficiency_with,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            cpu_user_s,
            cpu_sys_s,
        });
    }
    Ok(rows)
}
