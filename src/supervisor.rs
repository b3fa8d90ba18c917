//! Fault injection and standby promotion.
//!
//! Each worker owns a `FailureSupervisor` and runs its check inline at the
//! start of every batch cycle, under the line lock.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::shared_state::{LineState, SharedState};
use crate::types::{WorkerId, WorkerRole, WorkerState};

/// What happened to a station when its unit failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Substituted { failed: WorkerId, standby: WorkerId },
    /// No reserve was left; the station stays uncovered for the run.
    Uncovered { failed: WorkerId },
}

pub struct FailureSupervisor {
    probability: f64,
    rng: StdRng,
}

impl FailureSupervisor {
    /// `stream` separates the draws of units sharing one seed.
    pub fn new(probability: f64, seed: Option<u64>, stream: u64) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream.wrapping_mul(0x9E37_79B9))),
            None => StdRng::from_entropy(),
        };
        Self { probability, rng }
    }

    /// One draw against the failure probability.
    pub fn trips(&mut self) -> bool {
        self.probability > 0.0 && self.rng.gen_bool(self.probability)
    }

    /// Per-cycle check for unit `id`: draw only if eligible, and on a trip
    /// fail the unit and promote a standby in the same critical section.
    pub fn check_cycle(&mut self, shared: &SharedState, id: WorkerId) -> Option<FailureOutcome> {
        shared.with_state(|state| {
            if !is_eligible(state, id) || !self.trips() {
                return None;
            }
            Some(fail_and_promote(state, id))
        })
    }
}

/// Primaries that are neither failed nor disabled may fail.
pub(crate) fn is_eligible(state: &LineState, id: WorkerId) -> bool {
    let unit = &state.roster[id];
    unit.role == WorkerRole::Primary && !unit.failed && unit.state != WorkerState::Disabled
}

/// Fail `id` outside the random draw. Returns `None` if it already failed.
#[cfg(test)]
pub(crate) fn inject_failure(shared: &SharedState, id: WorkerId) -> Option<FailureOutcome> {
    shared.with_state(|state| {
        if state.roster[id].failed {
            return None;
        }
        Some(fail_and_promote(state, id))
    })
}

pub(crate) fn fail_and_promote(state: &mut LineState, failed: WorkerId) -> FailureOutcome {
    let unit = &mut state.roster[failed];
    unit.failed = true;
    unit.state = WorkerState::Failed;
    state.stats.failures += 1;
    warn!(worker = failed, "worker failed");
    promote(state, failed)
}

/// Activate the first disabled reserve in registration order at the failed
/// unit's station.
fn promote(state: &mut LineState, failed: WorkerId) -> FailureOutcome {
    let station = state.roster[failed].station_offset;
    let reserve = state.roster.iter_mut().find(|unit| {
        unit.role == WorkerRole::Standby && !unit.failed && unit.state == WorkerState::Disabled
    });
    match reserve {
        Some(standby) => {
            standby.state = WorkerState::Standby;
            standby.station_offset = station;
            standby.covering = Some(failed);
            let id = standby.id;
            state.stats.standby_activations += 1;
            info!(standby = id, failed, station, "standby promoted");
            FailureOutcome::Substituted {
                failed,
                standby: id,
            }
        }
        None => {
            state.stats.uncovered_stations += 1;
            warn!(failed, station, "no standby available; station uncovered");
            FailureOutcome::Uncovered { failed }
        }
    }
}
