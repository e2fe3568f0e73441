//! Sheetgate Codec - security-sanitizing tabular reader and writer
//!
//! Reads CSV/TSV and workbook buffers into records under hard limits (file
//! size, rows, columns, cell length). Dangerous content and blocked formulas
//! become per-cell errors; only file-level problems abort a read.
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetgate_codec::{ImportOptions, StreamingReader};
//! use sheetgate_monitor::{FileKind, NoopProbe, Reclaimer};
//! use std::sync::Arc;
//!
//! let probe = Arc::new(NoopProbe);
//! let reader = StreamingReader::new(probe.clone(), Arc::new(Reclaimer::new(probe)));
//! let result = reader.read(b"name\nAlice\n", FileKind::Csv, &ImportOptions::default()).await?;
//! assert_eq!(result.rows.len(), 1);
//! ```

pub mod cache;
pub mod chunk;
pub mod error;
pub mod options;
pub mod reader;
pub mod security;
pub mod source;
pub mod types;
pub mod writer;

pub use cache::SanitizeCache;
pub use chunk::{
    process_chunk, CellPolicy, ChunkCancelled, ChunkExecutor, ChunkOutcome, ChunkTask, HeaderMap, ParsedRow,
};
pub use error::CodecError;
pub use options::ImportOptions;
pub use reader::{ChunkProgress, StreamingReader, DEFAULT_PREVIEW_ROWS};
pub use security::{sanitize, sanitize_with_report, Sanitized, SecurityError};
pub use source::{SheetGrid, SheetLimits, SourceCell, SourceFormat, SourceRow};
pub use types::{
    column_letter, CellError, CellErrorKind, ImportMetadata, ImportResult, Preview, Record, ValidationReport,
};
pub use writer::{column_widths, StreamingWriter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
