//! Error taxonomy for setup and transport failures.
//!
//! In-run conditions (claim contention, worker failure, lost coverage) are
//! counted in `RunStatistics` instead of surfacing here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::BatchId;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("failed to read config {}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to spawn thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("thread `{name}` panicked")]
    ThreadPanicked { name: String },

    #[error("{what} exceeds limit: requested {requested}, limit {limit}")]
    CapacityExceeded {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    #[error("batch {current} is still available; refusing to publish batch {next}")]
    BatchAlreadyAvailable { current: BatchId, next: BatchId },

    #[error("malformed wire message")]
    Wire(#[from] serde_json::Error),
}

impl LineError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        LineError::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }
}
