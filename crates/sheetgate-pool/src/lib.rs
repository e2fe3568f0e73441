//! Sheetgate Pool
//!
//! Parallel chunk parsing off the caller's task:
//! - [`TaskEnvelope`]: typed request/response protocol keyed by [`TaskId`]
//! - [`TaskChannel`]: correlates responses with the caller awaiting them
//! - [`WorkerHandle`]: inbox of one worker running a [`ChunkProcessor`]
//! - [`ExecutionPool`]: bounded, lazily grown set of workers
//!
//! [`ExecutionPool`] implements [`sheetgate_codec::ChunkExecutor`], which is
//! how the streaming reader dispatches windows to it.
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetgate_pool::{ExecutionPool, PoolConfig};
//!
//! let pool = ExecutionPool::new(PoolConfig::default().with_max_workers(4))?;
//! let outcome = pool.run(task).await?;
//! pool.shutdown();
//! ```

#![warn(unreachable_pub)]

pub mod channel;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod worker;

pub use channel::{ResponseHandler, TaskChannel};
pub use envelope::{FailureKind, Payload, TaskEnvelope, TaskFailure, TaskId, TaskKind, WorkerId};
pub use error::PoolError;
pub use pool::{ExecutionPool, PoolConfig, PoolStats, TaskTicket};
pub use worker::{
    allowed_transitions, validate_transition, ChunkProcessor, IllegalTransition, RowProcessor, WorkerHandle,
    WorkerState,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
