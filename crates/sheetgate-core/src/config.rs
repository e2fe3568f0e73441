//! Engine configuration
//!
//! Every section has serde defaults, so a TOML file only needs the keys it
//! changes:
//!
//! ```toml
//! reevaluate_every_chunks = 3
//!
//! [thresholds]
//! warning = 0.7
//!
//! [import]
//! chunk_size = 500
//! allow_formulas = true
//! ```

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use sheetgate_codec::ImportOptions;
use sheetgate_monitor::{AdmissionConfig, MonitorConfig, ThresholdConfig};
use sheetgate_pool::PoolConfig;
use std::path::Path;

/// Default windows between threshold re-evaluations during a read
pub const DEFAULT_REEVALUATE_EVERY_CHUNKS: usize = 5;

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Windows between threshold re-evaluations during a read
    pub reevaluate_every_chunks: usize,
    /// Memory budget for the system probe; machine total when unset
    pub memory_budget_bytes: Option<u64>,
    /// Sampling interval and history
    pub monitor: MonitorConfig,
    /// Warning/critical ratios
    pub thresholds: ThresholdConfig,
    /// Per-kind multipliers and admit/reject ratios
    pub admission: AdmissionConfig,
    /// Worker cap and dispatch threshold
    pub pool: PoolConfig,
    /// Default options for import, validate, preview and export
    pub import: ImportOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reevaluate_every_chunks: DEFAULT_REEVALUATE_EVERY_CHUNKS,
            memory_budget_bytes: None,
            monitor: MonitorConfig::default(),
            thresholds: ThresholdConfig::default(),
            admission: AdmissionConfig::default(),
            pool: PoolConfig::default(),
            import: ImportOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate TOML
    ///
    /// # Errors
    /// `EngineError::Config` on syntax errors or invalid values
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// - `EngineError::Io` if the file cannot be read
    /// - `EngineError::Config` on syntax errors or invalid values
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Serialize as TOML
    ///
    /// # Errors
    /// `EngineError::Config` if a value has no TOML representation
    pub fn to_toml_string(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self).map_err(|err| EngineError::config(err.to_string()))
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// `EngineError::Config` (or `EngineError::Monitor` for threshold and
    /// admission ratios) describing the first violation
    pub fn validate(&self) -> Result<(), EngineError> {
        self.thresholds.validate()?;
        self.admission.validate()?;
        if self.pool.max_workers == 0 {
            return Err(EngineError::config("pool.max_workers must be at least 1"));
        }
        if self.import.chunk_size == 0 {
            return Err(EngineError::config("import.chunk_size must be at least 1"));
        }
        if self.reevaluate_every_chunks == 0 {
            return Err(EngineError::config("reevaluate_every_chunks must be at least 1"));
        }
        if self.monitor.sample_interval.is_zero() {
            return Err(EngineError::config("monitor.sample_interval must be positive"));
        }
        if self.memory_budget_bytes == Some(0) {
            return Err(EngineError::config("memory_budget_bytes must be positive when set"));
        }
        Ok(())
    }

    /// With import defaults
    #[inline]
    #[must_use]
    pub fn with_import(mut self, options: ImportOptions) -> Self {
        self.import = options;
        self
    }

    /// With pool configuration
    #[inline]
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// With thresholds
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: ThresholdConfig) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// With admission policy
    #[inline]
    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    /// With monitor configuration
    #[inline]
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// With re-evaluation cadence (at least one window)
    #[inline]
    #[must_use]
    pub fn with_reevaluate_every(mut self, chunks: usize) -> Self {
        self.reevaluate_every_chunks = chunks.max(1);
        self
    }

    /// With memory budget for the system probe
    #[inline]
    #[must_use]
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thresholds.warning, 0.80);
        assert_eq!(config.import.chunk_size, 1000);
        assert_eq!(config.reevaluate_every_chunks, DEFAULT_REEVALUATE_EVERY_CHUNKS);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            reevaluate_every_chunks = 3

            [thresholds]
            warning = 0.7

            [import]
            chunk_size = 500
            allow_formulas = true

            [pool]
            max_workers = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.reevaluate_every_chunks, 3);
        assert_eq!(config.thresholds.warning, 0.7);
        assert_eq!(config.thresholds.critical, 0.90);
        assert_eq!(config.import.chunk_size, 500);
        assert!(config.import.allow_formulas);
        assert_eq!(config.import.max_rows, 100_000);
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.pool.parallel_row_threshold, 10_000);
    }

    #[test]
    fn out_of_order_thresholds_rejected() {
        let err = EngineConfig::from_toml_str("[thresholds]\nwarning = 0.95\ncritical = 0.9\n").unwrap_err();
        assert!(matches!(err, EngineError::Monitor(_)));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = EngineConfig::from_toml_str("[import]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(ref message) if message.contains("chunk_size")));
    }

    #[test]
    fn syntax_error_is_config_error() {
        let err = EngineConfig::from_toml_str("reevaluate_every_chunks = ").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn toml_output_parses_back() {
        let config = EngineConfig::default()
            .with_reevaluate_every(7)
            .with_memory_budget(512 * 1024 * 1024);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheetgate.toml");
        std::fs::write(&path, "[import]\nmax_cell_length = 20\n").unwrap();

        let config = EngineConfig::from_path(&path).unwrap();
        assert_eq!(config.import.max_cell_length, 20);

        let missing = EngineConfig::from_path(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, EngineError::Io(_)));
    }
}
