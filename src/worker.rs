//! Execution loop for one worker unit.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::shared_state::{Publication, SharedState, Wakeup};
use crate::supervisor::{FailureOutcome, FailureSupervisor};
use crate::transport::StatusSink;
use crate::types::WorkerId;

/// Simulated seconds spent in `Returning` after each cycle.
const RETURN_PAUSE_SECS: f64 = 0.5;

/// How one cycle on a batch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleEnd {
    BudgetElapsed,
    NothingLeft,
    Shutdown,
}

pub struct WorkerTask {
    id: WorkerId,
    shared: Arc<SharedState>,
    supervisor: FailureSupervisor,
    status: Arc<dyn StatusSink>,
}

impl WorkerTask {
    pub fn new(
        id: WorkerId,
        shared: Arc<SharedState>,
        supervisor: FailureSupervisor,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            id,
            shared,
            supervisor,
            status,
        }
    }

    /// Serve batches until shutdown or failure. Returns items completed.
    pub fn run(mut self) -> u64 {
        let station = self.shared.worker(self.id).station_offset;
        debug!(worker = self.id, station, "worker started");
        let mut last_seen: Option<Publication> = None;
        loop {
            let publication = match self.shared.wait_for_batch(self.id, last_seen) {
                Wakeup::Batch(publication) => publication,
                Wakeup::Shutdown | Wakeup::Failed => break,
            };
            last_seen = Some(publication);

            if let Some(outcome) = self.supervisor.check_cycle(&self.shared, self.id) {
                self.report_failure(outcome);
                break;
            }
            if let CycleEnd::Shutdown = self.process_batch(publication) {
                break;
            }
        }
        let unit = self.shared.worker(self.id);
        info!(worker = self.id, completed = unit.completed, state = ?unit.state, "worker stopped");
        self.status.publish(&unit.status());
        unit.completed
    }

    fn process_batch(&self, publication: Publication) -> CycleEnd {
        let Some(budget) = self.shared.begin_cycle(self.id, publication) else {
            return CycleEnd::NothingLeft;
        };
        let params = self.shared.params().clone();
        let deadline = Instant::now() + budget;
        let end = loop {
            if self.shared.is_shutdown() {
                break CycleEnd::Shutdown;
            }
            if Instant::now() >= deadline {
                break CycleEnd::BudgetElapsed;
            }
            let Some(item) = self.shared.claim_next(self.id, publication, deadline) else {
                // Rivals hold or finished everything reachable; yield.
                break CycleEnd::NothingLeft;
            };
            let reach = params.reach_secs(item.offset.norm());
            thread::sleep(params.wall(reach));
            if !self.shared.complete(self.id, publication, item.index) {
                debug!(worker = self.id, publication, item = item.index, "batch retired mid-label");
            }
            // Return stroke to the reach origin.
            thread::sleep(params.wall(reach / 2.0));
        };
        debug!(worker = self.id, publication, ?end, "cycle finished");

        self.shared.set_returning(self.id);
        if end != CycleEnd::Shutdown {
            thread::sleep(params.wall(RETURN_PAUSE_SECS));
        }
        let status = self.shared.settle(self.id);
        self.status.publish(&status);
        end
    }

    fn report_failure(&self, outcome: FailureOutcome) {
        match outcome {
            FailureOutcome::Substituted { failed, standby } => {
                info!(failed, standby, "failure covered by standby");
            }
            FailureOutcome::Uncovered { failed } => {
                warn!(failed, "failure left station uncovered");
            }
        }
        self.status.publish(&self.shared.worker(self.id).status());
    }
}
