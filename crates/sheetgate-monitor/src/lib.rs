//! Sheetgate Monitor
//!
//! The memory side of the import engine:
//! - [`MemoryProbe`]: injectable capability that reads process memory
//! - [`ResourceMonitor`]: interval sampling with bounded history, peak and trend
//! - [`ThresholdPolicy`]: warning/critical classification with alert records
//! - [`Reclaimer`]: best-effort reclamation hints and cache invalidation
//! - [`AdmissionEstimator`]: admit/degrade/reject decisions per file kind and size
//!
//! Environments without memory introspection plug in [`NoopProbe`]. Every
//! component treats `heap_total == 0` as "monitoring unavailable" and stays
//! permissive.
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetgate_monitor::{AdmissionEstimator, FileKind, ResourceMonitor, SysinfoProbe};
//! use std::sync::Arc;
//!
//! let monitor = ResourceMonitor::new(Arc::new(SysinfoProbe::new()), Default::default());
//! let decision = AdmissionEstimator::default()
//!     .can_process(4 * 1024 * 1024, FileKind::Xlsx, &monitor.current_sample());
//! assert!(decision.can_process);
//! ```

#![warn(unreachable_pub)]

pub mod admission;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod reclaim;
pub mod threshold;

pub use admission::{AdmissionConfig, AdmissionDecision, AdmissionEstimator, FileKind};
pub use error::MonitorError;
pub use monitor::{MonitorConfig, ResourceMonitor, Trend};
pub use probe::{MemoryProbe, MemorySample, NoopProbe, RawMemory, SysinfoProbe};
pub use reclaim::{ReclaimReport, ReclaimStats, Reclaimable, Reclaimer};
pub use threshold::{AlertLevel, MemoryAlert, ThresholdConfig, ThresholdPolicy};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
