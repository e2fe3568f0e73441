//! Bounded execution pool
//!
//! Workers are created lazily up to `max_workers`. Capacity is a semaphore:
//! every busy worker holds one permit, so a caller waiting in
//! [`ExecutionPool::acquire`] wakes exactly when a release or crash returns
//! one. A crashed worker leaves every set and is never re-added; the next
//! acquire under the cap creates a replacement.

use crate::channel::TaskChannel;
use crate::envelope::{TaskEnvelope, TaskId, WorkerId};
use crate::error::PoolError;
use crate::worker::{spawn_worker, ChunkProcessor, RowProcessor, WorkerEvent, WorkerHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sheetgate_codec::{ChunkExecutor, ChunkOutcome, ChunkTask, CodecError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live workers
    pub max_workers: usize,
    /// Data rows above which an import is dispatched to the pool
    pub parallel_row_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            parallel_row_threshold: 10_000,
        }
    }
}

impl PoolConfig {
    /// Set worker cap (at least one)
    #[inline]
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Set dispatch threshold
    #[inline]
    #[must_use]
    pub fn with_parallel_row_threshold(mut self, rows: usize) -> Self {
        self.parallel_row_threshold = rows;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Workers created over the pool's lifetime
    pub total_created: usize,
    /// Workers waiting for a task
    pub idle: usize,
    /// Workers holding a task
    pub busy: usize,
    /// Workers lost to crashes
    pub crashed: usize,
    /// Tasks handed to workers
    pub tasks_dispatched: usize,
    /// Worker cap
    pub max_workers: usize,
}

#[derive(Default)]
struct PoolState {
    all: HashMap<WorkerId, WorkerHandle>,
    available: VecDeque<WorkerId>,
    busy: HashMap<WorkerId, OwnedSemaphorePermit>,
}

struct PoolInner {
    config: PoolConfig,
    runtime: tokio::runtime::Handle,
    processor: Arc<dyn ChunkProcessor>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    channel: Arc<TaskChannel>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    total_created: AtomicUsize,
    crashed: AtomicUsize,
    tasks_dispatched: AtomicUsize,
    shut_down: AtomicBool,
}

impl PoolInner {
    fn on_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Response(envelope) => {
                self.channel.dispatch(envelope);
            }
            WorkerEvent::Crashed { worker, reason } => {
                tracing::warn!(worker = %worker, %reason, "removing crashed worker");
                if self.remove_worker(worker) {
                    self.crashed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Remove `worker` from every set and stop it. Returns whether it was tracked.
    fn remove_worker(&self, worker: WorkerId) -> bool {
        let (handle, permit) = {
            let mut state = self.state.lock();
            state.available.retain(|id| *id != worker);
            (state.all.remove(&worker), state.busy.remove(&worker))
        };
        drop(permit);
        match handle {
            Some(handle) => {
                handle.terminate();
                true
            }
            None => false,
        }
    }
}

/// Bounded pool of chunk-processing workers
#[derive(Clone)]
pub struct ExecutionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ExecutionPool {
    /// Create a pool on the current tokio runtime
    ///
    /// # Errors
    /// `PoolError::NoRuntime` when called outside a tokio runtime
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_processor(config, Arc::new(RowProcessor))
    }

    /// Create a pool whose workers run `processor`
    ///
    /// # Errors
    /// `PoolError::NoRuntime` when called outside a tokio runtime
    pub fn with_processor(config: PoolConfig, processor: Arc<dyn ChunkProcessor>) -> Result<Self, PoolError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| PoolError::NoRuntime(err.to_string()))?;
        let config = PoolConfig {
            max_workers: config.max_workers.max(1),
            ..config
        };
        let (events, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_workers)),
            config,
            runtime: runtime.clone(),
            processor,
            state: Mutex::new(PoolState::default()),
            channel: Arc::new(TaskChannel::new()),
            events,
            total_created: AtomicUsize::new(0),
            crashed: AtomicUsize::new(0),
            tasks_dispatched: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        });
        runtime.spawn(route_events(Arc::downgrade(&inner), event_rx));

        tracing::info!(max_workers = inner.config.max_workers, "execution pool created");
        Ok(Self { inner })
    }

    /// Pool configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Correlation channel shared by all workers
    #[inline]
    #[must_use]
    pub fn channel(&self) -> &TaskChannel {
        &self.inner.channel
    }

    /// Take an idle worker, creating one if under the cap, or wait until one
    /// is released.
    ///
    /// # Errors
    /// `PoolError::Shutdown` once [`ExecutionPool::shutdown`] has run
    pub async fn acquire(&self) -> Result<WorkerHandle, PoolError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Shutdown)?;

        let mut state = self.inner.state.lock();
        let handle = loop {
            match state.available.pop_front() {
                Some(id) => {
                    if let Some(handle) = state.all.get(&id).filter(|h| !h.is_closed()).cloned() {
                        break handle;
                    }
                    state.all.remove(&id);
                }
                None => {
                    let handle = spawn_worker(
                        &self.inner.runtime,
                        Arc::clone(&self.inner.processor),
                        self.inner.events.clone(),
                    );
                    state.all.insert(handle.id(), handle.clone());
                    self.inner.total_created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(worker = %handle.id(), live = state.all.len(), "worker created");
                    break handle;
                }
            }
        };
        state.busy.insert(handle.id(), permit);
        Ok(handle)
    }

    /// Return a busy worker to the idle queue. No-op for workers not
    /// currently tracked as busy.
    pub fn release(&self, handle: &WorkerHandle) {
        let permit = {
            let mut state = self.inner.state.lock();
            let Some(permit) = state.busy.remove(&handle.id()) else {
                return;
            };
            if state.all.contains_key(&handle.id()) {
                state.available.push_back(handle.id());
            }
            permit
        };
        drop(permit);
    }

    /// Dispatch `task` to a worker
    ///
    /// # Errors
    /// - `PoolError::Shutdown` if the pool is shut down
    /// - `PoolError::ChannelClosed` if the chosen worker stopped
    pub async fn submit(&self, task: ChunkTask) -> Result<TaskTicket, PoolError> {
        let handle = self.acquire().await?;
        let id = TaskId::new();
        let index = task.index;

        let rx = match self.inner.channel.request(&handle, TaskEnvelope::process(id, task)) {
            Ok(rx) => rx,
            Err(err) => {
                self.inner.remove_worker(handle.id());
                return Err(err);
            }
        };
        self.inner.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = %id, worker = %handle.id(), chunk = index, "task dispatched");

        Ok(TaskTicket {
            id,
            pool: self.clone(),
            handle: Some(handle),
            rx: Some(rx),
        })
    }

    /// Dispatch `task` and wait for its outcome
    ///
    /// # Errors
    /// Any [`PoolError`] from dispatch or from the worker
    pub async fn run(&self, task: ChunkTask) -> Result<ChunkOutcome, PoolError> {
        self.submit(task).await?.wait().await
    }

    /// Stop every worker. Later acquires fail with `PoolError::Shutdown` and
    /// tasks still in flight resolve with `PoolError::ChannelClosed`.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let state = std::mem::take(&mut *self.inner.state.lock());
        for handle in state.all.values() {
            handle.terminate();
        }
        self.inner.channel.clear();
        tracing::info!(workers = state.all.len(), "execution pool shut down");
    }

    /// Whether [`ExecutionPool::shutdown`] has run
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            idle: state.available.len(),
            busy: state.busy.len(),
            crashed: self.inner.crashed.load(Ordering::Relaxed),
            tasks_dispatched: self.inner.tasks_dispatched.load(Ordering::Relaxed),
            max_workers: self.inner.config.max_workers,
        }
    }
}

async fn route_events(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.on_event(event);
    }
    tracing::trace!("pool event router stopped");
}

/// In-flight task
///
/// Dropping an unfinished ticket cancels the task; its worker returns to the
/// pool once it acknowledges.
#[derive(Debug)]
pub struct TaskTicket {
    id: TaskId,
    pool: ExecutionPool,
    handle: Option<WorkerHandle>,
    rx: Option<oneshot::Receiver<TaskEnvelope>>,
}

impl TaskTicket {
    /// Task ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Ask the worker to stop this task. The ticket then resolves with
    /// `PoolError::Cancelled` unless the result was already on its way.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            if handle.send(TaskEnvelope::cancel(self.id)).is_err() {
                tracing::trace!(task = %self.id, "cancel after worker stopped");
            }
        }
    }

    /// Wait for the terminal response and release the worker
    ///
    /// # Errors
    /// - `PoolError::Cancelled` if the task was cancelled
    /// - `PoolError::WorkerBusy` or `WorkerCrashed` from the worker
    /// - `PoolError::ChannelClosed` if the pool shut down first
    pub async fn wait(mut self) -> Result<ChunkOutcome, PoolError> {
        // The ticket keeps the worker until the response lands, so dropping
        // this future part way falls through to `Drop`.
        let response = match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(PoolError::ChannelClosed),
        };
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            self.pool.release(&handle);
        }
        response.map_err(|_| PoolError::ChannelClosed)?.into_outcome()
    }
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        let (Some(rx), Some(handle)) = (self.rx.take(), self.handle.take()) else {
            return;
        };
        let _ = handle.send(TaskEnvelope::cancel(self.id));
        let pool = self.pool.clone();
        self.pool.inner.runtime.spawn(async move {
            let _ = rx.await;
            pool.release(&handle);
        });
    }
}

#[async_trait]
impl ChunkExecutor for ExecutionPool {
    async fn execute(&self, task: ChunkTask) -> Result<ChunkOutcome, CodecError> {
        self.run(task)
            .await
            .map_err(|err| CodecError::Dispatch(err.to_string()))
    }

    fn parallelism(&self) -> usize {
        self.inner.config.max_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use pretty_assertions::assert_eq;
    use sheetgate_codec::{CellPolicy, ChunkCancelled, HeaderMap, SourceCell, SourceRow};
    use std::time::Duration;

    fn task(index: usize, values: &[&str]) -> ChunkTask {
        ChunkTask {
            index,
            first_row: 1,
            rows: values
                .iter()
                .map(|v| SourceRow::Cells(vec![SourceCell::Value((*v).to_string())]))
                .collect(),
            headers: Arc::new(HeaderMap {
                first_column: 0,
                columns: vec![Some("name".to_string())],
            }),
            policy: CellPolicy {
                max_cell_length: 100,
                allow_formulas: false,
                allow_html: false,
            },
        }
    }

    /// Blocks until cancelled
    struct GateProcessor;

    impl ChunkProcessor for GateProcessor {
        fn process(&self, task: &ChunkTask, cancel: &AtomicBool) -> Result<ChunkOutcome, ChunkCancelled> {
            while !cancel.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(ChunkCancelled {
                index: task.index,
                processed: 0,
            })
        }
    }

    struct PanicProcessor;

    impl ChunkProcessor for PanicProcessor {
        fn process(&self, _task: &ChunkTask, _cancel: &AtomicBool) -> Result<ChunkOutcome, ChunkCancelled> {
            panic!("decoder blew up");
        }
    }

    #[tokio::test]
    async fn third_acquire_waits_for_release() {
        let pool = ExecutionPool::new(PoolConfig::default().with_max_workers(2)).unwrap();

        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(pool.stats().busy, 2);

        pool.release(&first);
        let third = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(third.id(), first.id());
        let stats = pool.stats();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn release_is_noop_for_untracked_worker() {
        let pool = ExecutionPool::new(PoolConfig::default().with_max_workers(1)).unwrap();
        let handle = pool.acquire().await.unwrap();
        pool.release(&handle);
        pool.release(&handle);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.busy, 0);
    }

    #[tokio::test]
    async fn run_processes_chunk() {
        let pool = ExecutionPool::new(PoolConfig::default().with_max_workers(2)).unwrap();
        let outcome = pool.run(task(3, &["Alice", "", "Bob"])).await.unwrap();

        assert_eq!(outcome.index, 3);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.skipped_rows, 1);
        assert_eq!(outcome.rows[1].record.get("name").map(String::as_str), Some("Bob"));

        let stats = pool.stats();
        assert_eq!(stats.tasks_dispatched, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(pool.channel().pending(), 0);
    }

    #[tokio::test]
    async fn busy_worker_rejects_second_task() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(1), Arc::new(GateProcessor))
            .unwrap();
        let handle = pool.acquire().await.unwrap();

        let first = TaskId::new();
        let first_rx = pool
            .channel()
            .request(&handle, TaskEnvelope::process(first, task(0, &["a"])))
            .unwrap();
        let second = TaskId::new();
        let second_rx = pool
            .channel()
            .request(&handle, TaskEnvelope::process(second, task(1, &["b"])))
            .unwrap();

        let rejected = second_rx.await.unwrap();
        assert_eq!(rejected.into_outcome(), Err(PoolError::WorkerBusy(handle.id())));

        handle.send(TaskEnvelope::cancel(first)).unwrap();
        let done = first_rx.await.unwrap();
        assert!(matches!(done.payload, Payload::Complete));
        pool.release(&handle);
    }

    #[tokio::test]
    async fn cancel_completes_task() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(1), Arc::new(GateProcessor))
            .unwrap();
        let ticket = pool.submit(task(0, &["a"])).await.unwrap();
        let id = ticket.id();

        ticket.cancel();
        assert_eq!(ticket.wait().await, Err(PoolError::Cancelled(id)));

        // Worker survives cancellation and is reused.
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.crashed, 0);
    }

    async fn until_idle(pool: &ExecutionPool, idle: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.stats().idle != idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn dropped_ticket_returns_worker() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(1), Arc::new(GateProcessor))
            .unwrap();
        let ticket = pool.submit(task(0, &["a"])).await.unwrap();
        assert_eq!(pool.stats().busy, 1);

        drop(ticket);
        until_idle(&pool, 1).await;

        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.crashed, 0);
        assert_eq!(pool.channel().pending(), 0);
        let again = tokio::time::timeout(Duration::from_secs(5), pool.acquire()).await;
        assert!(matches!(again, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn abandoned_run_returns_worker() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(1), Arc::new(GateProcessor))
            .unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), pool.run(task(0, &["a"]))).await;
        assert!(timed_out.is_err());

        until_idle(&pool, 1).await;
        assert_eq!(pool.stats().busy, 0);
        let again = tokio::time::timeout(Duration::from_secs(5), pool.acquire()).await;
        assert!(matches!(again, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn abandoned_wait_returns_worker() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(1), Arc::new(GateProcessor))
            .unwrap();
        let ticket = pool.submit(task(0, &["a"])).await.unwrap();
        let waiting = tokio::spawn(ticket.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());

        until_idle(&pool, 1).await;
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn crash_shrinks_pool_until_next_acquire() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(2), Arc::new(PanicProcessor))
            .unwrap();

        let err = pool.run(task(0, &["a"])).await.unwrap_err();
        assert!(err.is_crash());

        let stats = pool.stats();
        assert_eq!(stats.crashed, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 0);

        let replacement = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().total_created, 2);
        pool.release(&replacement);
    }

    #[tokio::test]
    async fn shutdown_rejects_acquire() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(1), Arc::new(GateProcessor))
            .unwrap();
        let ticket = pool.submit(task(0, &["a"])).await.unwrap();

        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Shutdown);
        assert_eq!(ticket.wait().await, Err(PoolError::ChannelClosed));

        let stats = pool.stats();
        assert_eq!(stats.idle + stats.busy, 0);
    }

    #[tokio::test]
    async fn executor_maps_errors_to_dispatch() {
        let pool = ExecutionPool::with_processor(PoolConfig::default().with_max_workers(3), Arc::new(PanicProcessor))
            .unwrap();
        assert_eq!(pool.parallelism(), 3);
        let err = pool.execute(task(0, &["a"])).await.unwrap_err();
        assert!(matches!(err, CodecError::Dispatch(_)));
    }

    #[test]
    fn new_outside_runtime_fails() {
        let err = ExecutionPool::new(PoolConfig::default()).unwrap_err();
        assert!(matches!(err, PoolError::NoRuntime(_)));
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_workers": 3}"#).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.parallel_row_threshold, 10_000);
    }
}
