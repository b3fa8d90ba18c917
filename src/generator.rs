//! Synthetic item placement standing in for the vision stage.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::error::LineError;
use crate::transport::{BatchSource, SourceEvent, Wait};
use crate::types::{BatchId, Offset, WorkBatch};

const MAX_PLACEMENT_ATTEMPTS: usize = 100;

pub struct ItemGenerator {
    rng: StdRng,
    max_attempts: usize,
    placement_warnings: u64,
}

impl ItemGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            max_attempts: MAX_PLACEMENT_ATTEMPTS,
            placement_warnings: 0,
        }
    }

    /// Override the per-item retry bound (at least one attempt is made).
    #[cfg(test)]
    pub(crate) fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Items that kept their last attempted position after every retry failed
    /// to clear the minimum separation.
    pub fn placement_warnings(&self) -> u64 {
        self.placement_warnings
    }

    /// Build batch `seq` with `min..=max` items on a square of side `size`.
    ///
    /// Offsets stay `size / 10` inside the edges and at least `size / 15`
    /// apart, as far as the retry bound allows.
    pub fn generate(
        &mut self,
        seq: BatchId,
        min: usize,
        max: usize,
        size: f64,
    ) -> Result<WorkBatch, LineError> {
        let count = self.rng.gen_range(min..=max.max(min));
        let limit = size / 2.0 - size / 10.0;
        let separation = size / 15.0;

        let mut offsets: Vec<Offset> = Vec::with_capacity(count);
        for index in 0..count {
            let mut candidate = Offset::default();
            let mut placed = false;
            for _ in 0..self.max_attempts {
                candidate = Offset::new(
                    self.rng.gen_range(-limit..=limit),
                    self.rng.gen_range(-limit..=limit),
                );
                if offsets
                    .iter()
                    .all(|other| other.distance_to(&candidate) >= separation)
                {
                    placed = true;
                    break;
                }
            }
            if !placed {
                self.placement_warnings += 1;
                warn!(batch = seq, item = index, "no separated position found; keeping last attempt");
            }
            offsets.push(candidate);
        }
        debug!(batch = seq, items = count, "batch generated");
        WorkBatch::new(seq, offsets)
    }
}

/// `BatchSource` that generates `limit` batches on demand, then closes.
pub struct GeneratedSource {
    generator: ItemGenerator,
    min_items: usize,
    max_items: usize,
    batch_size: f64,
    next_seq: BatchId,
    limit: BatchId,
}

impl GeneratedSource {
    pub fn new(
        generator: ItemGenerator,
        min_items: usize,
        max_items: usize,
        batch_size: f64,
        limit: usize,
    ) -> Self {
        Self {
            generator,
            min_items,
            max_items,
            batch_size,
            next_seq: 0,
            limit: limit as BatchId,
        }
    }
}

impl BatchSource for GeneratedSource {
    fn next_batch(&mut self, _wait: Wait) -> SourceEvent {
        if self.next_seq >= self.limit {
            return SourceEvent::Closed;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        match self
            .generator
            .generate(seq, self.min_items, self.max_items, self.batch_size)
        {
            Ok(batch) => SourceEvent::Batch(batch),
            Err(err) => {
                warn!(batch = seq, error = %err, "generated batch rejected");
                SourceEvent::Closed
            }
        }
    }
}
