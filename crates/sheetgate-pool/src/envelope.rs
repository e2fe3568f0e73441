//! Task envelope protocol across the pool boundary
//!
//! Every in-flight task has a unique [`TaskId`]. Exactly one terminal envelope
//! (result, error or complete) is produced per id; progress envelopes are
//! zero-or-more and non-terminal. The kind is derived from the payload so the
//! two can never disagree.

use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use sheetgate_codec::{ChunkOutcome, ChunkTask};
use std::fmt;
use ulid::Ulid;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Ulid);

impl TaskId {
    /// Generate new task ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique worker identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Ulid);

impl WorkerId {
    /// Generate new worker ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Start processing (inbound)
    Process,
    /// Stop processing (inbound)
    Cancel,
    /// Partial progress (outbound, non-terminal)
    Progress,
    /// Finished with a value (outbound, terminal)
    Result,
    /// Finished with a failure (outbound, terminal)
    Error,
    /// Finished without a value, e.g. after cancel (outbound, terminal)
    Complete,
}

impl TaskKind {
    /// Whether this kind ends the task
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Result | Self::Error | Self::Complete)
    }
}

/// Failure class carried by an error envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Worker was already processing another task
    Busy,
    /// Worker died while processing
    Crashed,
    /// Task could not be processed
    Failed,
}

/// Error envelope payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Failure class
    pub kind: FailureKind,
    /// Worker that produced the failure
    pub worker: WorkerId,
    /// Description
    pub message: String,
}

impl TaskFailure {
    /// Convert into the error reported to the awaiting caller
    #[must_use]
    pub fn into_error(self, task: TaskId) -> PoolError {
        match self.kind {
            FailureKind::Busy => PoolError::WorkerBusy(self.worker),
            FailureKind::Crashed => PoolError::WorkerCrashed {
                worker: self.worker,
                reason: self.message,
            },
            FailureKind::Failed => PoolError::TaskFailed {
                task,
                message: self.message,
            },
        }
    }
}

/// Envelope payload
#[derive(Debug, Clone)]
pub enum Payload {
    /// Window to process
    Process(ChunkTask),
    /// Stop the task with this id
    Cancel,
    /// Work accepted or advanced
    Progress {
        /// Rows handled so far
        rows_processed: usize,
        /// Rows in the task
        rows_total: usize,
    },
    /// Processed window
    Result(ChunkOutcome),
    /// Failure
    Error(TaskFailure),
    /// Ended without a value
    Complete,
}

/// Message exchanged with a worker
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    /// Correlation id
    pub id: TaskId,
    /// Contents
    pub payload: Payload,
}

impl TaskEnvelope {
    /// Create envelope
    #[inline]
    #[must_use]
    pub fn new(id: TaskId, payload: Payload) -> Self {
        Self { id, payload }
    }

    /// Process request
    #[inline]
    #[must_use]
    pub fn process(id: TaskId, task: ChunkTask) -> Self {
        Self::new(id, Payload::Process(task))
    }

    /// Cancel request
    #[inline]
    #[must_use]
    pub fn cancel(id: TaskId) -> Self {
        Self::new(id, Payload::Cancel)
    }

    /// Error response
    #[inline]
    #[must_use]
    pub fn error(id: TaskId, kind: FailureKind, worker: WorkerId, message: impl Into<String>) -> Self {
        Self::new(
            id,
            Payload::Error(TaskFailure {
                kind,
                worker,
                message: message.into(),
            }),
        )
    }

    /// Envelope kind
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self.payload {
            Payload::Process(_) => TaskKind::Process,
            Payload::Cancel => TaskKind::Cancel,
            Payload::Progress { .. } => TaskKind::Progress,
            Payload::Result(_) => TaskKind::Result,
            Payload::Error(_) => TaskKind::Error,
            Payload::Complete => TaskKind::Complete,
        }
    }

    /// Whether this envelope ends its task
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Turn a terminal envelope into the caller-facing outcome
    ///
    /// # Errors
    /// - `PoolError::WorkerBusy`, `WorkerCrashed` or `TaskFailed` for error envelopes
    /// - `PoolError::Cancelled` for complete envelopes
    /// - `PoolError::ChannelClosed` for non-terminal envelopes
    pub fn into_outcome(self) -> Result<ChunkOutcome, PoolError> {
        match self.payload {
            Payload::Result(outcome) => Ok(outcome),
            Payload::Error(failure) => Err(failure.into_error(self.id)),
            Payload::Complete => Err(PoolError::Cancelled(self.id)),
            Payload::Process(_) | Payload::Cancel | Payload::Progress { .. } => Err(PoolError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds() {
        assert!(TaskKind::Result.is_terminal());
        assert!(TaskKind::Error.is_terminal());
        assert!(TaskKind::Complete.is_terminal());
        assert!(!TaskKind::Progress.is_terminal());
        assert!(!TaskKind::Process.is_terminal());
        assert!(!TaskKind::Cancel.is_terminal());
    }

    #[test]
    fn kind_follows_payload() {
        let id = TaskId::new();
        assert_eq!(TaskEnvelope::cancel(id).kind(), TaskKind::Cancel);
        let busy = TaskEnvelope::error(id, FailureKind::Busy, WorkerId::new(), "busy");
        assert_eq!(busy.kind(), TaskKind::Error);
        assert!(matches!(busy.into_outcome(), Err(PoolError::WorkerBusy(_))));
    }

    #[test]
    fn complete_maps_to_cancelled() {
        let id = TaskId::new();
        let envelope = TaskEnvelope::new(id, Payload::Complete);
        assert_eq!(envelope.into_outcome(), Err(PoolError::Cancelled(id)));
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskKind::Complete).unwrap(), "\"complete\"");
    }
}
