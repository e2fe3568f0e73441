//! Error types for the execution pool

use crate::envelope::{TaskId, WorkerId};

/// Pool and worker failures
///
/// Surfaced only to the caller awaiting the affected task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Worker already processing another task
    #[error("worker {0} is busy")]
    WorkerBusy(WorkerId),

    /// Worker died while processing a task
    #[error("worker {worker} crashed: {reason}")]
    WorkerCrashed {
        /// Crashed worker
        worker: WorkerId,
        /// Panic or failure description
        reason: String,
    },

    /// Task finished with an error envelope
    #[error("task {task} failed: {message}")]
    TaskFailed {
        /// Failed task
        task: TaskId,
        /// Error payload
        message: String,
    },

    /// Task was cancelled before producing a result
    #[error("task {0} cancelled")]
    Cancelled(TaskId),

    /// Worker inbox or response channel closed
    #[error("channel closed")]
    ChannelClosed,

    /// Pool has been shut down
    #[error("pool is shut down")]
    Shutdown,

    /// Pool needs a tokio runtime to spawn workers
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),
}

impl PoolError {
    /// Check if error is retryable. The pool never retries on its own.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Check if error reduced pool capacity
    #[inline]
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::WorkerCrashed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_classification() {
        let err = PoolError::WorkerCrashed {
            worker: WorkerId::new(),
            reason: "panic".into(),
        };
        assert!(err.is_crash());
        assert!(!err.is_retryable());
        assert!(!PoolError::Shutdown.is_crash());
        assert_eq!(PoolError::Shutdown.to_string(), "pool is shut down");
    }
}
