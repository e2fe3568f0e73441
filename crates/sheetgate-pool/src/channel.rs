//! Correlation of task requests with worker responses
//!
//! Handlers are registered under the envelope id before the envelope leaves,
//! so a response can never beat its handler. Terminal envelopes remove the
//! handler before invoking it, which makes the terminal call happen at most
//! once per id.

use crate::envelope::{TaskEnvelope, TaskId};
use crate::error::PoolError;
use crate::worker::WorkerHandle;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// Response callback
///
/// Progress handlers run while the correlation table is locked for that id;
/// a handler must not call back into the channel.
pub type ResponseHandler = Box<dyn FnMut(TaskEnvelope) + Send + Sync>;

/// Task correlation table
#[derive(Default)]
pub struct TaskChannel {
    handlers: DashMap<TaskId, ResponseHandler>,
}

impl std::fmt::Debug for TaskChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskChannel")
            .field("pending", &self.handlers.len())
            .finish()
    }
}

impl TaskChannel {
    /// Create empty channel
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `on_response` for `envelope.id` and deliver the envelope.
    ///
    /// # Errors
    /// `PoolError::ChannelClosed` if the worker has stopped; the handler is
    /// unregistered again
    pub fn send<F>(&self, handle: &WorkerHandle, envelope: TaskEnvelope, on_response: F) -> Result<(), PoolError>
    where
        F: FnMut(TaskEnvelope) + Send + Sync + 'static,
    {
        let id = envelope.id;
        self.handlers.insert(id, Box::new(on_response));
        if let Err(err) = handle.send(envelope) {
            self.handlers.remove(&id);
            return Err(err);
        }
        tracing::trace!(task = %id, worker = %handle.id(), "envelope sent");
        Ok(())
    }

    /// Deliver `envelope` and resolve with its terminal response. Progress
    /// envelopes are consumed.
    ///
    /// # Errors
    /// `PoolError::ChannelClosed` if the worker has stopped
    pub fn request(
        &self,
        handle: &WorkerHandle,
        envelope: TaskEnvelope,
    ) -> Result<oneshot::Receiver<TaskEnvelope>, PoolError> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.send(handle, envelope, move |response| {
            if response.is_terminal() {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(response);
                }
            }
        })?;
        Ok(rx)
    }

    /// Route an inbound envelope to its handler.
    ///
    /// Returns `false` when no handler is registered; such envelopes are
    /// dropped, e.g. progress arriving after a cancel already resolved the id.
    pub fn dispatch(&self, envelope: TaskEnvelope) -> bool {
        let id = envelope.id;
        if envelope.is_terminal() {
            let Some((_, mut handler)) = self.handlers.remove(&id) else {
                tracing::trace!(task = %id, kind = ?envelope.kind(), "dropping unregistered response");
                return false;
            };
            handler(envelope);
            return true;
        }

        match self.handlers.get_mut(&id) {
            Some(mut handler) => {
                (handler.value_mut())(envelope);
                true
            }
            None => {
                tracing::trace!(task = %id, kind = ?envelope.kind(), "dropping unregistered progress");
                false
            }
        }
    }

    /// Unregister a handler without invoking it
    pub fn forget(&self, id: TaskId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    /// Drop every handler. Awaiting [`TaskChannel::request`] receivers resolve
    /// with a closed-channel error.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Number of tasks awaiting a terminal response
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{FailureKind, Payload, WorkerId};
    use crate::worker::{spawn_worker, RowProcessor, WorkerEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn idle_worker() -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(&tokio::runtime::Handle::current(), Arc::new(RowProcessor), events);
        (handle, rx)
    }

    fn progress(id: TaskId) -> TaskEnvelope {
        TaskEnvelope::new(
            id,
            Payload::Progress {
                rows_processed: 1,
                rows_total: 2,
            },
        )
    }

    #[tokio::test]
    async fn terminal_invokes_handler_once() {
        let (handle, _events) = idle_worker();
        let channel = TaskChannel::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = TaskId::new();

        let seen = Arc::clone(&calls);
        channel
            .send(&handle, TaskEnvelope::cancel(id), move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(channel.dispatch(progress(id)));
        assert!(channel.dispatch(progress(id)));
        assert!(channel.dispatch(TaskEnvelope::new(id, Payload::Complete)));
        assert!(!channel.dispatch(TaskEnvelope::new(id, Payload::Complete)));
        assert!(!channel.dispatch(progress(id)));

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(channel.pending(), 0);
    }

    #[tokio::test]
    async fn unregistered_ids_are_dropped() {
        let channel = TaskChannel::new();
        let stray = TaskEnvelope::error(TaskId::new(), FailureKind::Failed, WorkerId::new(), "late");
        assert!(!channel.dispatch(stray));
    }

    #[tokio::test]
    async fn request_resolves_with_terminal() {
        let (handle, _events) = idle_worker();
        let channel = TaskChannel::new();
        let id = TaskId::new();

        let rx = channel.request(&handle, TaskEnvelope::cancel(id)).unwrap();
        channel.dispatch(progress(id));
        channel.dispatch(TaskEnvelope::new(id, Payload::Complete));

        let response = rx.await.unwrap();
        assert_eq!(response.id, id);
        assert!(matches!(response.payload, Payload::Complete));
    }

    #[tokio::test]
    async fn closed_worker_unregisters_handler() {
        let (handle, mut events) = idle_worker();
        handle.terminate();
        assert!(events.recv().await.is_none());

        let channel = TaskChannel::new();
        let err = channel.send(&handle, TaskEnvelope::cancel(TaskId::new()), |_| {}).unwrap_err();
        assert_eq!(err, PoolError::ChannelClosed);
        assert_eq!(channel.pending(), 0);
    }

    #[tokio::test]
    async fn forget_discards_handler() {
        let (handle, _events) = idle_worker();
        let channel = TaskChannel::new();
        let id = TaskId::new();
        let _rx = channel.request(&handle, TaskEnvelope::cancel(id)).unwrap();
        assert!(channel.forget(id));
        assert!(!channel.dispatch(TaskEnvelope::new(id, Payload::Complete)));
    }
}
