//! Error types for the monitoring layer

/// Monitoring errors
///
/// Resource pressure itself is never an error; alerts are values produced by
/// [`crate::ThresholdPolicy`]. These variants cover lifecycle and configuration
/// mistakes only.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// `start` called while the sampling task is running
    #[error("resource monitor already running")]
    AlreadyRunning,

    /// No tokio runtime available to host the sampling task
    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    /// Invalid threshold or admission configuration
    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorError {
    /// Create a configuration error
    #[inline]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
