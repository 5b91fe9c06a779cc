mod batch;
pub mod pool;

pub use batch::BatchRunner;
pub use pool::{JobHandle, JobObserver, JobOutcome, PoolError, ProbeJob, ProberFactory, WorkerPool};

use crate::config::{BatchId, ConfigError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn label(self) -> &'static str {
        match self {
            BatchStatus::Idle => "idle",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Cancelled)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time view of a batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchState {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: u64,
    /// Probes handed to a worker so far.
    pub submitted: u64,
    pub completed: u64,
    /// Queued probes discarded by cancellation; never dispatched.
    pub dropped: u64,
    pub is_running: bool,
    pub is_paused: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot {action} a batch that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: BatchStatus,
    },
    #[error("batch cancellation is already in progress")]
    CancelPending,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests;
