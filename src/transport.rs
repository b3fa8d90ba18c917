//! Boundary between the line and whatever feeds it batches or watches its
//! workers. In-process this is a channel; across a process boundary the same
//! messages travel as `Envelope` JSON documents.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LineError;
use crate::types::{WorkBatch, WorkerStatus};

/// How long `next_batch` may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    Timeout(Duration),
    Blocking,
}

#[derive(Debug)]
pub enum SourceEvent {
    Batch(WorkBatch),
    /// Nothing arrived within the wait.
    Empty,
    /// The producer is done; no more batches will come.
    Closed,
}

pub trait BatchSource: Send {
    fn next_batch(&mut self, wait: Wait) -> SourceEvent;
}

pub trait StatusSink: Send + Sync {
    fn publish(&self, status: &WorkerStatus);
}

/// Discards every snapshot.
pub struct NullSink;

impl StatusSink for NullSink {
    fn publish(&self, _status: &WorkerStatus) {}
}

/// Snapshots travel as `Envelope::Status`, the same message a remote
/// observer would decode.
impl StatusSink for Sender<Envelope> {
    fn publish(&self, status: &WorkerStatus) {
        // A departed observer is not the line's problem.
        let _ = self.send(Envelope::Status(*status));
    }
}

/// One message between a producer process and the line.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Envelope {
    Batch(WorkBatch),
    Status(WorkerStatus),
    Shutdown,
}

impl Envelope {
    pub fn to_wire(&self) -> Result<String, LineError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(raw: &str) -> Result<Self, LineError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// `BatchSource` over the receiving half of an envelope channel.
pub struct ChannelSource {
    rx: Receiver<Envelope>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Bounded queue of at most `capacity` envelopes in flight.
    pub fn bounded(capacity: usize) -> (mpsc::SyncSender<Envelope>, Self) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (tx, Self::new(rx))
    }

    fn receive(&self, wait: Wait, deadline: Option<Instant>) -> Result<Envelope, SourceEvent> {
        match wait {
            Wait::NonBlocking => self.rx.try_recv().map_err(|err| match err {
                TryRecvError::Empty => SourceEvent::Empty,
                TryRecvError::Disconnected => SourceEvent::Closed,
            }),
            Wait::Timeout(_) => {
                let remaining = deadline
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                self.rx.recv_timeout(remaining).map_err(|err| match err {
                    RecvTimeoutError::Timeout => SourceEvent::Empty,
                    RecvTimeoutError::Disconnected => SourceEvent::Closed,
                })
            }
            Wait::Blocking => self.rx.recv().map_err(|_| SourceEvent::Closed),
        }
    }
}

impl BatchSource for ChannelSource {
    fn next_batch(&mut self, wait: Wait) -> SourceEvent {
        let deadline = match wait {
            Wait::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };
        loop {
            match self.receive(wait, deadline) {
                Ok(Envelope::Batch(batch)) => return SourceEvent::Batch(batch),
                Ok(Envelope::Shutdown) => return SourceEvent::Closed,
                Ok(Envelope::Status(status)) => {
                    debug!(worker = status.id, "status envelope on batch channel ignored");
                }
                Err(event) => return event,
            }
        }
    }
}
