//! Admission control for incoming files
//!
//! A heuristic gate: estimate the in-memory footprint of a file from its kind
//! and size, compare with what the latest sample says is available, and admit,
//! admit with a warning, or reject. Actual usage can still exceed the estimate;
//! the threshold policy is the runtime backstop.

use crate::error::MonitorError;
use crate::probe::MemorySample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Tabular file kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Office Open XML workbook
    Xlsx,
    /// Macro-enabled workbook
    Xlsm,
    /// Binary workbook
    Xlsb,
    /// Legacy BIFF workbook
    Xls,
    /// OpenDocument spreadsheet
    Ods,
    /// Comma separated values
    Csv,
    /// Tab separated values
    Tsv,
    /// Anything else
    Unknown,
}

impl FileKind {
    /// Classify a file extension (case-insensitive, leading dot allowed)
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "xlsx" => Self::Xlsx,
            "xlsm" => Self::Xlsm,
            "xlsb" => Self::Xlsb,
            "xls" => Self::Xls,
            "ods" => Self::Ods,
            "csv" => Self::Csv,
            "tsv" | "tab" => Self::Tsv,
            _ => Self::Unknown,
        }
    }

    /// Classify a path by its extension
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(Self::Unknown, Self::from_extension)
    }

    /// Canonical lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xlsx => "xlsx",
            Self::Xlsm => "xlsm",
            Self::Xlsb => "xlsb",
            Self::Xls => "xls",
            Self::Ods => "ods",
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Unknown => "unknown",
        }
    }

    /// Delimited text rather than a workbook container
    #[inline]
    #[must_use]
    pub fn is_delimited(self) -> bool {
        matches!(self, Self::Csv | Self::Tsv)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimator policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Expansion multiplier per file kind name
    pub multipliers: BTreeMap<String, f64>,
    /// Multiplier for kinds missing from the table
    pub default_multiplier: f64,
    /// Above `available * high_water_ratio` the file runs hot
    pub high_water_ratio: f64,
    /// Above `available * reject_ratio` the file is rejected
    pub reject_ratio: f64,
}

impl AdmissionConfig {
    /// With multiplier for a kind
    #[inline]
    #[must_use]
    pub fn with_multiplier(mut self, kind: FileKind, multiplier: f64) -> Self {
        self.multipliers.insert(kind.as_str().to_string(), multiplier);
        self
    }

    /// Check ratios and multipliers are positive and ordered
    ///
    /// # Errors
    /// `MonitorError::InvalidConfig` on non-positive or unordered values
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.default_multiplier <= 0.0 || self.multipliers.values().any(|m| *m <= 0.0) {
            return Err(MonitorError::invalid_config("multipliers must be positive"));
        }
        if !(self.high_water_ratio > 0.0 && self.high_water_ratio <= self.reject_ratio) {
            return Err(MonitorError::invalid_config(format!(
                "admission ratios must satisfy 0 < high_water ({}) <= reject ({})",
                self.high_water_ratio, self.reject_ratio
            )));
        }
        Ok(())
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let multipliers = [
            (FileKind::Xlsx, 5.0),
            (FileKind::Xlsm, 5.0),
            (FileKind::Xls, 4.0),
            (FileKind::Ods, 4.0),
            (FileKind::Xlsb, 3.0),
            (FileKind::Csv, 2.0),
            (FileKind::Tsv, 2.0),
        ]
        .into_iter()
        .map(|(kind, m)| (kind.as_str().to_string(), m))
        .collect();

        Self {
            multipliers,
            default_multiplier: 3.0,
            high_water_ratio: 0.8,
            reject_ratio: 1.2,
        }
    }
}

/// Admission verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    /// Whether processing may proceed
    pub can_process: bool,
    /// Why processing was refused or degraded
    pub reason: Option<String>,
    /// Ordered advice for the caller
    pub suggestions: Vec<String>,
}

impl AdmissionDecision {
    fn admit() -> Self {
        Self {
            can_process: true,
            reason: None,
            suggestions: Vec::new(),
        }
    }
}

/// File admission estimator
#[derive(Debug, Clone, Default)]
pub struct AdmissionEstimator {
    config: AdmissionConfig,
}

impl AdmissionEstimator {
    /// Create an estimator
    #[inline]
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    /// Estimator policy
    #[inline]
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Expansion multiplier applied to `kind`
    #[must_use]
    pub fn multiplier(&self, kind: FileKind) -> f64 {
        self.config
            .multipliers
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.config.default_multiplier)
    }

    /// Predicted in-memory bytes for a file
    #[must_use]
    pub fn estimate_needed(&self, file_size: u64, kind: FileKind) -> u64 {
        (file_size as f64 * self.multiplier(kind)).ceil() as u64
    }

    /// Decide whether a file can be processed given `sample`
    #[must_use]
    pub fn can_process(&self, file_size: u64, kind: FileKind, sample: &MemorySample) -> AdmissionDecision {
        if sample.is_unavailable() {
            let mut decision = AdmissionDecision::admit();
            decision
                .suggestions
                .push("memory monitoring unavailable; proceeding without admission control".to_string());
            return decision;
        }

        let needed = self.estimate_needed(file_size, kind) as f64;
        let available = sample.available() as f64;

        if needed <= available * self.config.high_water_ratio {
            return AdmissionDecision::admit();
        }

        let mut suggestions = vec![
            "process the file with streaming enabled".to_string(),
            "reduce the chunk size to lower peak memory".to_string(),
            "split the file into smaller parts".to_string(),
        ];

        if needed > available * self.config.reject_ratio {
            let reason = format!(
                "estimated {} MiB needed for {} file of {} MiB, only {} MiB available",
                mib(needed),
                kind,
                mib(file_size as f64),
                mib(available)
            );
            tracing::warn!(file_size, %kind, needed, available, "admission rejected");
            return AdmissionDecision {
                can_process: false,
                reason: Some(reason),
                suggestions,
            };
        }

        tracing::info!(file_size, %kind, needed, available, "admitted near memory limit");
        suggestions.insert(0, "processing will run close to the memory limit".to_string());
        AdmissionDecision {
            can_process: true,
            reason: Some("estimated usage is close to available memory".to_string()),
            suggestions,
        }
    }
}

fn mib(bytes: f64) -> u64 {
    (bytes / (1024.0 * 1024.0)).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn file_kind_from_extension() {
        assert_eq!(FileKind::from_extension("XLSX"), FileKind::Xlsx);
        assert_eq!(FileKind::from_extension(".csv"), FileKind::Csv);
        assert_eq!(FileKind::from_path("report.ods"), FileKind::Ods);
        assert_eq!(FileKind::from_path("notes"), FileKind::Unknown);
    }

    #[test]
    fn estimate_uses_kind_multiplier() {
        let estimator = AdmissionEstimator::default();
        assert_eq!(estimator.estimate_needed(100, FileKind::Xlsx), 500);
        assert_eq!(estimator.estimate_needed(100, FileKind::Csv), 200);
        assert_eq!(estimator.estimate_needed(100, FileKind::Unknown), 300);
    }

    #[test]
    fn unavailable_monitoring_admits() {
        let estimator = AdmissionEstimator::default();
        let decision = estimator.can_process(100 * MB, FileKind::Xlsx, &MemorySample::with_usage(0, 0));
        assert!(decision.can_process);
        assert!(decision.reason.is_none());
        assert!(decision.suggestions[0].contains("unavailable"));
    }

    #[test]
    fn oversized_file_rejected_with_reason() {
        let estimator = AdmissionEstimator::default();
        let decision = estimator.can_process(100 * MB, FileKind::Xlsx, &MemorySample::with_usage(0, 100 * MB));
        assert!(!decision.can_process);
        assert!(!decision.reason.unwrap().is_empty());
        assert!(!decision.suggestions.is_empty());
    }

    #[test]
    fn near_limit_admits_with_warning() {
        let estimator = AdmissionEstimator::default();
        // 2x of 50 MiB = 100 MiB needed against 100 MiB available: hot but under 1.2x
        let decision = estimator.can_process(50 * MB, FileKind::Csv, &MemorySample::with_usage(0, 100 * MB));
        assert!(decision.can_process);
        assert!(decision.reason.is_some());
        assert!(decision.suggestions[0].contains("close to the memory limit"));
    }

    #[test]
    fn small_file_admitted_cleanly() {
        let estimator = AdmissionEstimator::default();
        let decision = estimator.can_process(MB, FileKind::Xlsx, &MemorySample::with_usage(10 * MB, 1024 * MB));
        assert_eq!(decision, AdmissionDecision::admit());
    }

    #[test]
    fn invalid_ratios_rejected() {
        let config = AdmissionConfig {
            high_water_ratio: 1.5,
            reject_ratio: 1.2,
            ..AdmissionConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(AdmissionConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_rejection_implies_estimate_exceeds_available(
            size in 0u64..(512 * MB),
            used in 0u64..(1024 * MB),
            extra in 0u64..(1024 * MB),
        ) {
            let estimator = AdmissionEstimator::default();
            let sample = MemorySample::with_usage(used, used + extra);
            let decision = estimator.can_process(size, FileKind::Xlsx, &sample);
            if !decision.can_process {
                prop_assert!(estimator.estimate_needed(size, FileKind::Xlsx) > sample.available());
                prop_assert!(decision.reason.is_some());
            }
        }
    }
}
