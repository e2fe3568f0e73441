//! Error types for the codec
//!
//! Only file-level failures are errors. Cell and row problems are recorded as
//! [`CellError`](crate::CellError) values inside the result.

/// Fatal, file-level codec failures
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Buffer exceeds `max_file_size`
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge {
        /// Buffer length
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// Source has no tabular sheet (or the requested one is missing)
    #[error("no sheet found{}", .0.as_deref().map(|name| format!(": {name}")).unwrap_or_default())]
    NoSheet(Option<String>),

    /// Processed sheet is wider or taller than allowed
    #[error("sheet dimensions {rows}x{columns} exceed limits {max_rows}x{max_columns}")]
    DimensionExceeded {
        /// Raw row count, header included
        rows: usize,
        /// Used column count
        columns: usize,
        /// Configured row limit
        max_rows: usize,
        /// Configured column limit
        max_columns: usize,
    },

    /// Nothing to write
    #[error("no data to write")]
    EmptyData,

    /// Source bytes could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// Workbook could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// A chunk could not be processed by the executor
    #[error("chunk dispatch failed: {0}")]
    Dispatch(String),
}

impl CodecError {
    /// Check if error rejected the file before any row was processed
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FileTooLarge { .. } | Self::NoSheet(_) | Self::DimensionExceeded { .. } | Self::EmptyData
        )
    }

    /// Check if error is retryable. Nothing in the codec retries on its own.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<calamine::Error> for CodecError {
    fn from(err: calamine::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<csv::Error> for CodecError {
    fn from(err: csv::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
