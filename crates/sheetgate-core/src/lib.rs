//! Sheetgate Core
//!
//! [`ImportEngine`] ties the pieces together: admission control against the
//! current memory sample, the streaming reader with pooled window dispatch,
//! threshold re-evaluation between windows, and XLSX export.
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetgate_core::{EngineConfig, ImportEngine};
//! use sheetgate_monitor::FileKind;
//!
//! let engine = ImportEngine::with_system_probe(EngineConfig::from_path("sheetgate.toml")?)?;
//! engine.start()?;
//! let result = engine.import(&bytes, FileKind::Csv).await?;
//! println!("{} rows, {} errors", result.rows.len(), result.errors.len());
//! engine.shutdown();
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod engine;
pub mod error;

pub use config::{EngineConfig, DEFAULT_REEVALUATE_EVERY_CHUNKS};
pub use engine::ImportEngine;
pub use error::EngineError;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
