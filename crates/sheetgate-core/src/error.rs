//! Error types for the import engine

use sheetgate_codec::CodecError;
use sheetgate_monitor::MonitorError;
use sheetgate_pool::PoolError;

/// Engine error
///
/// Per-cell problems never appear here; they are values inside
/// [`sheetgate_codec::ImportResult`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Admission refused the file before decoding
    #[error("file rejected: {reason}")]
    AdmissionRejected {
        /// Why the file was refused
        reason: String,
        /// What the caller can do about it
        suggestions: Vec<String>,
    },

    /// File-level read or write failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Monitor lifecycle or policy configuration failure
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Execution pool failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking export task did not finish
    #[error("background task failed: {0}")]
    Background(String),
}

impl EngineError {
    /// Create a configuration error
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if error rejected the file as a whole
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::AdmissionRejected { .. } => true,
            Self::Codec(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Check if error is retryable. Retry policy belongs to the caller.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Suggestions attached to an admission rejection
    #[must_use]
    pub fn suggestions(&self) -> &[String] {
        match self {
            Self::AdmissionRejected { suggestions, .. } => suggestions,
            _ => &[],
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
