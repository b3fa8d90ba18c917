//! Conveyor cadence: publish one batch, hold it for its transit, retire it,
//! wait out the gap, repeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::LineError;
use crate::shared_state::{Publication, SharedState};
use crate::sizing;
use crate::transport::{BatchSource, SourceEvent, Wait};
use crate::types::WorkBatch;

const SOURCE_POLL: Duration = Duration::from_millis(50);
/// Position updates per transit.
const TRANSIT_TICKS: u32 = 20;
/// Cancellation is observed at least this often during long holds.
const CANCEL_POLL: Duration = Duration::from_millis(10);
const DRAIN_LIMIT: Duration = Duration::from_secs(5);

pub struct ConveyorFeeder {
    shared: Arc<SharedState>,
    source: Box<dyn BatchSource>,
    cancel: Arc<AtomicBool>,
}

impl ConveyorFeeder {
    pub fn new(
        shared: Arc<SharedState>,
        source: Box<dyn BatchSource>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared,
            source,
            cancel,
        }
    }

    /// Feed batches until the source closes or cancellation. Always leaves
    /// the line shut down. Returns the number of batches retired.
    pub fn run(mut self) -> Result<u64, LineError> {
        let result = self.feed();
        self.shared.request_shutdown();
        result
    }

    fn feed(&mut self) -> Result<u64, LineError> {
        let params = self.shared.params().clone();
        let mut retired = 0;
        loop {
            if self.cancelled() {
                break;
            }
            let batch = match self.source.next_batch(Wait::Timeout(SOURCE_POLL)) {
                SourceEvent::Batch(batch) => batch,
                SourceEvent::Empty => continue,
                SourceEvent::Closed => {
                    debug!("batch source closed");
                    break;
                }
            };
            if params.demand_scaling {
                self.scale_for(&batch);
            }

            let seq = batch.seq;
            let publication = match self.shared.publish(batch) {
                Ok(Some(publication)) => publication,
                Ok(None) => break,
                Err(err @ LineError::CapacityExceeded { .. }) => {
                    warn!(batch = seq, error = %err, "batch rejected");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let interrupted = self.hold_transit(publication);
            if interrupted {
                // Stop new claims first, then let in-flight items land.
                self.shared.request_shutdown();
                self.shared.wait_for_idle_hands(DRAIN_LIMIT);
            }
            if let Some(outcome) = self.shared.retire(publication) {
                retired += 1;
                info!(
                    batch = seq,
                    completed = outcome.completed,
                    missed = outcome.missed,
                    "batch retired"
                );
            }
            if interrupted || self.pause(params.wall(params.batch_gap_secs())) {
                break;
            }
        }
        Ok(retired)
    }

    fn scale_for(&self, batch: &WorkBatch) {
        let required = sizing::required_workers(self.shared.params(), batch.len());
        let (activated, deactivated) =
            self.shared.with_state(|state| state.scale_primaries(required));
        if activated + deactivated > 0 {
            info!(batch = batch.seq, required, activated, deactivated, "primaries rescaled");
        }
    }

    /// Hold `publication` on the line for its full transit. Returns true if
    /// cancellation cut the hold short.
    fn hold_transit(&self, publication: Publication) -> bool {
        let params = self.shared.params();
        let tick = params.wall(params.transit_secs()) / TRANSIT_TICKS;
        for step in 1..=TRANSIT_TICKS {
            if self.pause(tick) {
                return true;
            }
            let position = params.line_length * f64::from(step) / f64::from(TRANSIT_TICKS);
            self.shared.advance_position(publication, position);
        }
        false
    }

    /// Sleep for `span`, waking early on cancellation. Returns true if
    /// cancelled.
    fn pause(&self, span: Duration) -> bool {
        let deadline = Instant::now() + span;
        loop {
            if self.cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}
