//! Line state shared by the feeder and every worker unit.
//!
//! All mutation goes through one mutex. One condition variable is broadcast
//! on every change a blocked thread might be waiting for: batch published,
//! batch retired, worker promoted or re-enabled, item released, shutdown.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::claim::{self, ClaimedItem};
use crate::config::SystemParameters;
use crate::error::LineError;
use crate::types::{
    BatchOutcome, ItemIndex, MAX_ITEMS_PER_BATCH, RunStatistics, WorkBatch, WorkerId,
    WorkerRole, WorkerState, WorkerStatus, WorkerUnit,
};

/// Number of one publication on the line, counted from 1. Distinct even when
/// a producer reuses a batch `seq`.
pub type Publication = u64;

/// Result of a worker blocking for its next batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    Batch(Publication),
    Shutdown,
    Failed,
}

/// Everything guarded by the line mutex.
pub struct LineState {
    pub(crate) roster: Vec<WorkerUnit>,
    pub(crate) current: Option<WorkBatch>,
    /// Publication number of `current`; 0 before the first publish.
    pub(crate) publication: Publication,
    pub(crate) available: bool,
    pub(crate) published_at: Option<Instant>,
    pub(crate) stats: RunStatistics,
    pub(crate) shutdown: bool,
    line_length: f64,
    line_speed: f64,
}

impl LineState {
    fn live_batch_mut(&mut self, publication: Publication) -> Option<&mut WorkBatch> {
        if !self.available || self.publication != publication {
            return None;
        }
        self.current.as_mut()
    }

    /// Simulated seconds a unit may keep claiming on one batch.
    pub(crate) fn time_budget_secs(&self, id: WorkerId) -> f64 {
        let own = self.roster[id].station_offset;
        let next = self
            .roster
            .iter()
            .filter(|unit| unit.role == WorkerRole::Primary)
            .map(|unit| unit.station_offset)
            .filter(|&offset| offset > own)
            .fold(self.line_length, f64::min);
        (next - own).max(0.0) / self.line_speed
    }

    /// Primaries neither disabled nor failed.
    pub(crate) fn enabled_primaries(&self) -> usize {
        self.roster
            .iter()
            .filter(|unit| unit.role == WorkerRole::Primary)
            .filter(|unit| !unit.failed && unit.state != WorkerState::Disabled)
            .count()
    }

    /// Enable or disable primaries until `required` are enabled, as far as
    /// the roster allows. Returns `(activated, deactivated)`.
    pub(crate) fn scale_primaries(&mut self, required: usize) -> (usize, usize) {
        let enabled = self.enabled_primaries();
        if required > enabled {
            let mut activated = 0;
            for unit in self.roster.iter_mut() {
                if activated == required - enabled {
                    break;
                }
                if unit.role == WorkerRole::Primary
                    && !unit.failed
                    && unit.state == WorkerState::Disabled
                {
                    unit.state = WorkerState::Idle;
                    activated += 1;
                    debug!(worker = unit.id, "primary enabled");
                }
            }
            (activated, 0)
        } else {
            let mut deactivated = 0;
            // Highest ids go first so the head of the line stays staffed.
            for unit in self.roster.iter_mut().rev() {
                if deactivated == enabled - required {
                    break;
                }
                if unit.role == WorkerRole::Primary && unit.state == WorkerState::Idle {
                    unit.state = WorkerState::Disabled;
                    deactivated += 1;
                    debug!(worker = unit.id, "primary disabled");
                }
            }
            (0, deactivated)
        }
    }
}

/// Single owned aggregate threaded through every line component.
pub struct SharedState {
    params: SystemParameters,
    inner: Mutex<LineState>,
    changed: Condvar,
}

impl SharedState {
    /// Build the roster: primaries at their stations, then disabled standbys.
    pub fn new(params: SystemParameters) -> Self {
        let mut roster = Vec::with_capacity(params.total_workers());
        for slot in 0..params.primary_workers {
            roster.push(WorkerUnit::primary(slot, params.station_offset(slot)));
        }
        for id in params.primary_workers..params.total_workers() {
            roster.push(WorkerUnit::standby(id));
        }
        let state = LineState {
            stats: RunStatistics::with_workers(roster.len()),
            roster,
            current: None,
            publication: 0,
            available: false,
            published_at: None,
            shutdown: false,
            line_length: params.line_length,
            line_speed: params.line_speed,
        };
        Self {
            params,
            inner: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    pub fn params(&self) -> &SystemParameters {
        &self.params
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.inner.lock().expect("line state mutex poisoned")
    }

    /// Run `f` under the lock, then wake every waiter.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LineState) -> R) -> R {
        let mut guard = self.lock();
        let result = f(&mut guard);
        self.changed.notify_all();
        result
    }

    /// Make `batch` the live batch and wake all workers.
    ///
    /// Returns `Ok(None)` without publishing once shutdown was requested.
    pub fn publish(&self, mut batch: WorkBatch) -> Result<Option<Publication>, LineError> {
        if batch.len() > MAX_ITEMS_PER_BATCH {
            return Err(LineError::CapacityExceeded {
                what: "items per batch",
                requested: batch.len(),
                limit: MAX_ITEMS_PER_BATCH,
            });
        }
        let mut guard = self.lock();
        if guard.shutdown {
            return Ok(None);
        }
        if guard.available {
            let current = guard.current.as_ref().map_or(0, |live| live.seq);
            return Err(LineError::BatchAlreadyAvailable {
                current,
                next: batch.seq,
            });
        }
        batch.reset_claims();
        guard.stats.batches_seen += 1;
        guard.stats.items_seen += batch.len() as u64;
        guard.publication += 1;
        let publication = guard.publication;
        info!(batch = batch.seq, publication, items = batch.len(), "batch published");
        guard.current = Some(batch);
        guard.available = true;
        guard.published_at = Some(Instant::now());
        // Publish-then-signal under the same lock.
        self.changed.notify_all();
        Ok(Some(publication))
    }

    pub fn advance_position(&self, publication: Publication, position: f64) {
        let mut guard = self.lock();
        if let Some(batch) = guard.live_batch_mut(publication) {
            batch.position = position;
        }
    }

    /// Retire `publication` and fold its counts into the run statistics.
    ///
    /// A second retirement of the same publication is a no-op returning `None`.
    pub fn retire(&self, publication: Publication) -> Option<BatchOutcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.publication != publication {
            return None;
        }
        let batch = state.current.as_mut()?;
        if batch.retired {
            return None;
        }
        batch.retired = true;
        let outcome = BatchOutcome {
            seq: batch.seq,
            total: batch.len(),
            completed: batch.completed,
            missed: batch.missed(),
        };
        state.available = false;
        state.stats.items_completed += outcome.completed as u64;
        state.stats.items_missed += outcome.missed as u64;
        state.stats.batches.push(outcome);
        self.changed.notify_all();
        Some(outcome)
    }

    /// Block until a publication this worker has not yet seen is available
    /// and the worker is ready for it, or until shutdown or failure.
    pub fn wait_for_batch(&self, id: WorkerId, last_seen: Option<Publication>) -> Wakeup {
        let mut guard = self.lock();
        loop {
            if guard.shutdown {
                return Wakeup::Shutdown;
            }
            let unit = &guard.roster[id];
            if unit.failed {
                return Wakeup::Failed;
            }
            if guard.available
                && unit.state.is_ready()
                && guard.current.is_some()
                && Some(guard.publication) != last_seen
            {
                return Wakeup::Batch(guard.publication);
            }
            // Spurious wakeups fall through to the predicate again.
            guard = self.changed.wait(guard).expect("line condvar wait failed");
        }
    }

    /// Enter `Active` on `publication`; returns the wall-clock claim budget.
    pub fn begin_cycle(&self, id: WorkerId, publication: Publication) -> Option<Duration> {
        let mut guard = self.lock();
        if guard.shutdown || !guard.roster[id].state.is_ready() {
            return None;
        }
        guard.live_batch_mut(publication)?;
        let budget = guard.time_budget_secs(id);
        guard.roster[id].state = WorkerState::Active;
        Some(self.params.wall(budget))
    }

    /// Claim the nearest unclaimed item of `publication` for `id`, unless the
    /// deadline passed, the batch retired, or shutdown began.
    pub fn claim_next(
        &self,
        id: WorkerId,
        publication: Publication,
        deadline: Instant,
    ) -> Option<ClaimedItem> {
        let mut guard = self.lock();
        if guard.shutdown || Instant::now() >= deadline {
            return None;
        }
        let claimed = claim::claim_nearest(guard.live_batch_mut(publication)?, id)?;
        let unit = &mut guard.roster[id];
        unit.state = WorkerState::Processing;
        unit.holding = Some(claimed.index);
        Some(claimed)
    }

    /// Claim a specific item of `publication` for `id`.
    pub fn try_claim(&self, id: WorkerId, publication: Publication, item: ItemIndex) -> bool {
        let mut guard = self.lock();
        if guard.shutdown {
            return false;
        }
        let Some(batch) = guard.live_batch_mut(publication) else {
            return false;
        };
        if !claim::try_claim(batch, item, id) {
            return false;
        }
        let unit = &mut guard.roster[id];
        unit.state = WorkerState::Processing;
        unit.holding = Some(item);
        true
    }

    /// Finish processing `item`. Returns false if the batch retired first.
    pub fn complete(&self, id: WorkerId, publication: Publication, item: ItemIndex) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let elapsed = state
            .published_at
            .map(|at| at.elapsed())
            .unwrap_or_default();
        let done = match state.current.as_mut() {
            Some(batch) if state.publication == publication => {
                claim::complete(batch, item, id, elapsed)
            }
            _ => false,
        };
        let unit = &mut state.roster[id];
        unit.holding = None;
        if unit.state == WorkerState::Processing {
            unit.state = WorkerState::Active;
        }
        if done {
            unit.completed += 1;
            state.stats.per_worker_completed[id] += 1;
        } else {
            debug!(publication, item, worker = id, "late completion discarded");
        }
        self.changed.notify_all();
        done
    }

    pub fn set_returning(&self, id: WorkerId) {
        let mut guard = self.lock();
        let unit = &mut guard.roster[id];
        if !unit.failed {
            unit.state = WorkerState::Returning;
        }
    }

    /// Settle back to the idle-equivalent state after a cycle.
    pub fn settle(&self, id: WorkerId) -> WorkerStatus {
        self.with_state(|state| {
            let unit = &mut state.roster[id];
            if !unit.failed && unit.state != WorkerState::Disabled {
                unit.state = match unit.covering {
                    Some(_) => WorkerState::Standby,
                    None => WorkerState::Idle,
                };
            }
            unit.status()
        })
    }

    /// Block until no worker holds an item, or `limit` elapses.
    pub fn wait_for_idle_hands(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        let mut guard = self.lock();
        while guard.roster.iter().any(|unit| unit.holding.is_some()) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (next, _) = self
                .changed
                .wait_timeout(guard, deadline - now)
                .expect("line condvar wait failed");
            guard = next;
        }
    }

    pub fn request_shutdown(&self) {
        let mut guard = self.lock();
        if !guard.shutdown {
            info!("shutdown requested");
        }
        guard.shutdown = true;
        self.changed.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    pub fn current_batch(&self) -> Option<WorkBatch> {
        self.lock().current.clone()
    }

    pub fn roster(&self) -> Vec<WorkerUnit> {
        self.lock().roster.clone()
    }

    pub fn worker(&self, id: WorkerId) -> WorkerUnit {
        self.lock().roster[id].clone()
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        self.lock().roster.iter().map(WorkerUnit::status).collect()
    }

    pub fn statistics(&self) -> RunStatistics {
        self.lock().stats.clone()
    }
}
