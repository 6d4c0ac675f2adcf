//! Reconciliation error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::clients::{ApiError, MutationOp, TaskHandle};
use crate::model::{ModelError, TargetKey};

/// Errors surfaced by a reconciliation call.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Desired or observed state failed validation.
    #[error("invalid attachment: {0}")]
    Validation(#[from] ModelError),

    /// Configuration rejected by [`crate::config::SyncConfig::validate`].
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A transient error kept recurring until the retry budget ran out.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: ApiError,
    },

    /// Non-retryable provider error.
    #[error("{operation} failed: {source}")]
    Fatal {
        operation: String,
        source: ApiError,
    },

    /// Live membership could not be fetched before a removal.
    #[error("live state of {scope} unavailable: {source}")]
    LiveStateUnavailable {
        scope: String,
        source: Box<SyncError>,
    },

    /// The provider task reached its failed state.
    #[error("task {task} failed: {detail}")]
    TaskFailed { task: TaskHandle, detail: String },

    /// A deadline elapsed. The underlying mutation may still complete.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("operation cancelled")]
    Cancelled,

    /// Some chunks were applied before a chunk failed.
    #[error("{0}")]
    PartialApplication(Box<PartialApplication>),
}

impl SyncError {
    /// Whether re-running the whole reconciliation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RetryExhausted { .. }
            | SyncError::Timeout { .. }
            | SyncError::LiveStateUnavailable { .. } => true,
            SyncError::PartialApplication(partial) => partial.failed.cause.is_retryable(),
            SyncError::Validation(_)
            | SyncError::Config(_)
            | SyncError::Fatal { .. }
            | SyncError::TaskFailed { .. }
            | SyncError::Cancelled => false,
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// One chunk that was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub op: MutationOp,
    pub index: usize,
    /// Targets sent to the provider.
    pub dispatched: Vec<TargetKey>,
    /// Targets dropped because they were no longer live.
    pub already_absent: Vec<TargetKey>,
    pub task: Option<TaskHandle>,
    pub polls: u32,
}

/// A chunk that was planned but never dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub op: MutationOp,
    pub index: usize,
    pub targets: Vec<TargetKey>,
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{} ({} targets)", self.op, self.index, self.targets.len())
    }
}

/// The chunk whose failure stopped the reconciliation.
#[derive(Debug)]
pub struct ChunkFailure {
    pub chunk: ChunkRef,
    pub cause: SyncError,
}

/// Which chunks of a multi-chunk reconciliation were applied.
///
/// Re-running the reconciliation is safe: it recomputes the diff from live
/// state and only submits what is still missing.
#[derive(Debug)]
pub struct PartialApplication {
    pub completed: Vec<ChunkReport>,
    pub failed: ChunkFailure,
    pub not_attempted: Vec<ChunkRef>,
}

impl fmt::Display for PartialApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partially applied: {} chunk(s) completed, chunk {} failed ({}), {} chunk(s) not attempted",
            self.completed.len(),
            self.failed.chunk,
            self.failed.cause,
            self.not_attempted.len()
        )
    }
}
