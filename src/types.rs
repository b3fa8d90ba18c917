//! Shared identifiers, work items, batches, and worker descriptors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LineError;

/// Sequence identifier of a batch on the line.
pub type BatchId = u64;
/// Identifier of a worker unit; also its index in the roster.
pub type WorkerId = usize;
/// Position of an item within its batch.
pub type ItemIndex = usize;

/// Ceiling on roster size (primaries plus standbys).
pub const MAX_WORKERS: usize = 32;
/// Ceiling on items carried by one batch.
pub const MAX_ITEMS_PER_BATCH: usize = 100;
/// Ceiling on batches waiting in the transport queue.
pub const MAX_QUEUED_BATCHES: usize = 50;

/// 2-D offset from a batch's reference centroid, in centimetres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
}

impl Offset {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Straight-line distance from the reach origin.
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance_to(&self, other: &Offset) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Claim lifecycle of an item. Only ever advances forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemLabel {
    Unclaimed,
    Claimed,
    Completed,
}

impl ItemLabel {
    /// Whether `self -> next` is a legal single step.
    pub fn can_advance_to(self, next: ItemLabel) -> bool {
        matches!(
            (self, next),
            (ItemLabel::Unclaimed, ItemLabel::Claimed) | (ItemLabel::Claimed, ItemLabel::Completed)
        )
    }
}

/// One labeling position inside a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: ItemIndex,
    pub offset: Offset,
    pub label: ItemLabel,
    /// Worker that claimed the item, absent while unclaimed.
    pub claimant: Option<WorkerId>,
    /// Time since the batch was published when the item completed.
    pub completed_at: Option<Duration>,
}

impl WorkItem {
    pub fn new(index: ItemIndex, offset: Offset) -> Self {
        Self {
            index,
            offset,
            label: ItemLabel::Unclaimed,
            claimant: None,
            completed_at: None,
        }
    }
}

/// A group of items travelling together through the line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkBatch {
    pub seq: BatchId,
    pub items: Vec<WorkItem>,
    /// Distance travelled along the line, in centimetres.
    pub position: f64,
    pub completed: usize,
    /// Set once every item reached `Completed`.
    pub all_completed: bool,
    /// Set once the batch's transit budget elapsed and its stats were folded.
    pub retired: bool,
}

impl WorkBatch {
    /// Build a batch from offsets, indexing items in order.
    pub fn new(seq: BatchId, offsets: Vec<Offset>) -> Result<Self, LineError> {
        if offsets.len() > MAX_ITEMS_PER_BATCH {
            return Err(LineError::CapacityExceeded {
                what: "items per batch",
                requested: offsets.len(),
                limit: MAX_ITEMS_PER_BATCH,
            });
        }
        let items = offsets
            .into_iter()
            .enumerate()
            .map(|(index, offset)| WorkItem::new(index, offset))
            .collect();
        Ok(Self {
            seq,
            items,
            position: 0.0,
            completed: 0,
            all_completed: false,
            retired: false,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn missed(&self) -> usize {
        self.items.len() - self.completed
    }

    /// Put every item back to `Unclaimed` before (re)publication and
    /// renumber items by position.
    pub fn reset_claims(&mut self) {
        for (index, item) in self.items.iter_mut().enumerate() {
            item.index = index;
            item.label = ItemLabel::Unclaimed;
            item.claimant = None;
            item.completed_at = None;
        }
        self.completed = 0;
        self.all_completed = false;
        self.retired = false;
        self.position = 0.0;
    }
}

/// Per-batch result folded into the run statistics at retirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub seq: BatchId,
    pub total: usize,
    pub completed: usize,
    pub missed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRole {
    Primary,
    Standby,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Active,
    Processing,
    Returning,
    Disabled,
    Failed,
    Standby,
}

impl WorkerState {
    /// States from which a unit may start a batch cycle.
    pub fn is_ready(self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Standby)
    }
}

/// Descriptor of one robot in the roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerUnit {
    pub id: WorkerId,
    pub role: WorkerRole,
    /// Station position along the line, in centimetres.
    pub station_offset: f64,
    pub state: WorkerState,
    pub holding: Option<ItemIndex>,
    pub completed: u64,
    pub failed: bool,
    /// For promoted standbys: the failed unit being covered.
    pub covering: Option<WorkerId>,
}

impl WorkerUnit {
    pub fn primary(id: WorkerId, station_offset: f64) -> Self {
        Self {
            id,
            role: WorkerRole::Primary,
            station_offset,
            state: WorkerState::Idle,
            holding: None,
            completed: 0,
            failed: false,
            covering: None,
        }
    }

    /// Reserve units start disabled with no station until promoted.
    pub fn standby(id: WorkerId) -> Self {
        Self {
            id,
            role: WorkerRole::Standby,
            station_offset: 0.0,
            state: WorkerState::Disabled,
            holding: None,
            completed: 0,
            failed: false,
            covering: None,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            role: self.role,
            state: self.state,
            completed: self.completed,
            covering: self.covering,
        }
    }
}

/// Snapshot published to status sinks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub role: WorkerRole,
    pub state: WorkerState,
    pub completed: u64,
    pub covering: Option<WorkerId>,
}

/// Monotonic run counters. Never decremented.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub batches_seen: u64,
    pub items_seen: u64,
    pub items_completed: u64,
    pub items_missed: u64,
    pub failures: u64,
    pub standby_activations: u64,
    /// Failures for which no standby was left.
    pub uncovered_stations: u64,
    pub per_worker_completed: Vec<u64>,
    pub batches: Vec<BatchOutcome>,
}

impl RunStatistics {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            per_worker_completed: vec![0; workers],
            ..Self::default()
        }
    }

    /// Completed share of all items seen, in percent.
    pub fn efficiency(&self) -> f64 {
        if self.items_seen == 0 {
            return 0.0;
        }
        100.0 * self.items_completed as f64 / self.items_seen as f64
    }
}
