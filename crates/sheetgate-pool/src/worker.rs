//! Worker lifecycle and message loop
//!
//! A worker is a tokio task owning an inbox. Processing runs on the blocking
//! thread pool so a long window never stalls the runtime; the blocking job
//! reports back through the worker's own inbox. Nothing mutable is shared
//! with the pool: tasks arrive by value and results leave by value.

use crate::envelope::{FailureKind, Payload, TaskEnvelope, TaskId, WorkerId};
use crate::error::PoolError;
use sheetgate_codec::{process_chunk, ChunkCancelled, ChunkOutcome, ChunkTask};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Spawned, not yet accepting work
    Created,
    /// Waiting for a task
    Idle,
    /// Processing a task
    Busy,
    /// Stopped for good
    Terminated,
}

/// Error for an illegal lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal worker transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// Current state
    pub from: WorkerState,
    /// Requested state
    pub to: WorkerState,
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: WorkerState) -> &'static [WorkerState] {
    use WorkerState::{Busy, Created, Idle, Terminated};
    match from {
        Created => &[Idle, Terminated],
        Idle => &[Busy, Terminated],
        Busy => &[Idle, Terminated],
        Terminated => &[],
    }
}

/// Validate a lifecycle transition
///
/// # Errors
/// `IllegalTransition` when `to` is not reachable from `from`
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Work performed for one window on a blocking thread
pub trait ChunkProcessor: Send + Sync + 'static {
    /// Process `task`, checking `cancel` as often as practical
    ///
    /// # Errors
    /// `ChunkCancelled` when `cancel` was raised
    fn process(&self, task: &ChunkTask, cancel: &AtomicBool) -> Result<ChunkOutcome, ChunkCancelled>;
}

/// Row-sanitizing processor
#[derive(Debug, Clone, Copy, Default)]
pub struct RowProcessor;

impl ChunkProcessor for RowProcessor {
    fn process(&self, task: &ChunkTask, cancel: &AtomicBool) -> Result<ChunkOutcome, ChunkCancelled> {
        process_chunk(task, cancel)
    }
}

/// Messages delivered to a worker's inbox
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// Task envelope (process or cancel)
    Envelope(TaskEnvelope),
    /// Blocking job finished
    Finished {
        id: TaskId,
        result: Result<Result<ChunkOutcome, ChunkCancelled>, JoinError>,
    },
    /// Stop the worker
    Shutdown,
}

/// Events a worker reports to the pool
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Response envelope for the task channel
    Response(TaskEnvelope),
    /// Worker is gone and must leave every pool set
    Crashed { worker: WorkerId, reason: String },
}

/// Handle for communicating with a worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    /// Worker ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Deliver an envelope to the worker
    ///
    /// # Errors
    /// `PoolError::ChannelClosed` if the worker has stopped
    pub fn send(&self, envelope: TaskEnvelope) -> Result<(), PoolError> {
        self.sender
            .send(WorkerMessage::Envelope(envelope))
            .map_err(|_| PoolError::ChannelClosed)
    }

    /// Whether the worker's inbox is closed
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ask the worker to stop. No-op if it already has.
    pub fn terminate(&self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }
}

/// Spawn a worker on `runtime`
pub(crate) fn spawn_worker(
    runtime: &tokio::runtime::Handle,
    processor: Arc<dyn ChunkProcessor>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let id = WorkerId::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let inbox = tx.downgrade();
    let worker = Worker {
        id,
        state: WorkerState::Created,
        running: None,
        processor,
        events,
        inbox,
        runtime: runtime.clone(),
    };
    runtime.spawn(worker.run(rx));
    WorkerHandle { id, sender: tx }
}

struct Running {
    id: TaskId,
    cancel: Arc<AtomicBool>,
}

struct Worker {
    id: WorkerId,
    state: WorkerState,
    running: Option<Running>,
    processor: Arc<dyn ChunkProcessor>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    inbox: mpsc::WeakUnboundedSender<WorkerMessage>,
    runtime: tokio::runtime::Handle,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        self.transition(WorkerState::Idle);
        tracing::debug!(worker = %self.id, "worker started");

        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Envelope(envelope) => self.on_envelope(envelope),
                WorkerMessage::Finished { id, result } => {
                    if !self.on_finished(id, result) {
                        break;
                    }
                }
                WorkerMessage::Shutdown => break,
            }
        }
        drop(rx);

        if let Some(running) = self.running.take() {
            running.cancel.store(true, Ordering::Relaxed);
        }
        if self.state != WorkerState::Terminated {
            self.transition(WorkerState::Terminated);
        }
        tracing::debug!(worker = %self.id, "worker stopped");
    }

    fn transition(&mut self, to: WorkerState) {
        match validate_transition(self.state, to) {
            Ok(()) => self.state = to,
            Err(err) => tracing::error!(worker = %self.id, error = %err, "worker state violation"),
        }
    }

    fn respond(&self, envelope: TaskEnvelope) {
        if self.events.send(WorkerEvent::Response(envelope)).is_err() {
            tracing::trace!(worker = %self.id, "pool gone, response dropped");
        }
    }

    fn on_envelope(&mut self, envelope: TaskEnvelope) {
        let TaskEnvelope { id, payload } = envelope;
        match payload {
            Payload::Process(task) => {
                if self.running.is_some() {
                    tracing::debug!(worker = %self.id, task = %id, "rejecting task while busy");
                    self.respond(TaskEnvelope::error(id, FailureKind::Busy, self.id, "worker busy"));
                    return;
                }
                self.start(id, task);
            }
            Payload::Cancel => match &self.running {
                Some(running) if running.id == id => {
                    tracing::debug!(worker = %self.id, task = %id, "cancel requested");
                    running.cancel.store(true, Ordering::Relaxed);
                }
                _ => tracing::trace!(worker = %self.id, task = %id, "cancel for task not running"),
            },
            Payload::Progress { .. } | Payload::Result(_) | Payload::Error(_) | Payload::Complete => {
                tracing::trace!(worker = %self.id, task = %id, "ignoring outbound envelope");
            }
        }
    }

    fn start(&mut self, id: TaskId, task: ChunkTask) {
        self.transition(WorkerState::Busy);
        let cancel = Arc::new(AtomicBool::new(false));
        self.running = Some(Running {
            id,
            cancel: Arc::clone(&cancel),
        });

        self.respond(TaskEnvelope::new(
            id,
            Payload::Progress {
                rows_processed: 0,
                rows_total: task.rows.len(),
            },
        ));

        let processor = Arc::clone(&self.processor);
        let inbox = self.inbox.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let result = runtime
                .spawn_blocking(move || processor.process(&task, &cancel))
                .await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(WorkerMessage::Finished { id, result });
            }
        });
    }

    /// Returns `false` when the worker must stop.
    fn on_finished(&mut self, id: TaskId, result: Result<Result<ChunkOutcome, ChunkCancelled>, JoinError>) -> bool {
        if self.running.as_ref().map(|running| running.id) != Some(id) {
            tracing::warn!(worker = %self.id, task = %id, "finished task was not running");
            return true;
        }
        self.running = None;

        match result {
            Ok(Ok(outcome)) => {
                self.transition(WorkerState::Idle);
                self.respond(TaskEnvelope::new(id, Payload::Result(outcome)));
                true
            }
            Ok(Err(cancelled)) => {
                tracing::debug!(worker = %self.id, task = %id, processed = cancelled.processed, "task cancelled");
                self.transition(WorkerState::Idle);
                self.respond(TaskEnvelope::new(id, Payload::Complete));
                true
            }
            Err(join) => {
                let reason = if join.is_panic() {
                    "panic while processing".to_string()
                } else {
                    join.to_string()
                };
                tracing::error!(worker = %self.id, task = %id, %reason, "worker crashed");
                self.transition(WorkerState::Terminated);
                // Crashed must reach the pool before the error envelope.
                let _ = self.events.send(WorkerEvent::Crashed {
                    worker: self.id,
                    reason: reason.clone(),
                });
                self.respond(TaskEnvelope::error(id, FailureKind::Crashed, self.id, reason));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        assert!(validate_transition(WorkerState::Created, WorkerState::Idle).is_ok());
        assert!(validate_transition(WorkerState::Idle, WorkerState::Busy).is_ok());
        assert!(validate_transition(WorkerState::Busy, WorkerState::Idle).is_ok());
        assert!(validate_transition(WorkerState::Busy, WorkerState::Terminated).is_ok());
        assert!(validate_transition(WorkerState::Created, WorkerState::Busy).is_err());
        assert!(validate_transition(WorkerState::Terminated, WorkerState::Idle).is_err());
        assert!(allowed_transitions(WorkerState::Terminated).is_empty());
    }

    #[tokio::test]
    async fn handle_reports_closed_after_shutdown() {
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(&tokio::runtime::Handle::current(), Arc::new(RowProcessor), events);
        handle.terminate();
        // Worker drops its events sender on exit.
        assert!(event_rx.recv().await.is_none());
        assert!(handle.is_closed());
        assert!(matches!(handle.send(TaskEnvelope::cancel(TaskId::new())), Err(PoolError::ChannelClosed)));
    }
}
