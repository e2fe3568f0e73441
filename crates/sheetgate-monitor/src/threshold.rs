//! Usage-ratio thresholds and alert records
//!
//! Advisory only: evaluation never blocks and never fails. Callers decide what
//! an alert means for them.

use crate::error::MonitorError;
use crate::probe::MemorySample;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Threshold ratios (`heap_used / heap_total`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Warning at or above this ratio
    pub warning: f64,
    /// Critical at or above this ratio
    pub critical: f64,
    /// Critical alerts at or above this ratio are tagged as emergencies
    pub emergency: f64,
    /// Retained alert records
    pub alert_log_cap: usize,
}

impl ThresholdConfig {
    /// Check ordering `0 < warning < critical <= emergency`
    ///
    /// # Errors
    /// `MonitorError::InvalidConfig` when the ratios are out of order
    pub fn validate(&self) -> Result<(), MonitorError> {
        if !(self.warning > 0.0 && self.warning < self.critical && self.critical <= self.emergency) {
            return Err(MonitorError::invalid_config(format!(
                "thresholds must satisfy 0 < warning ({}) < critical ({}) <= emergency ({})",
                self.warning, self.critical, self.emergency
            )));
        }
        Ok(())
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            warning: 0.80,
            critical: 0.90,
            emergency: 0.95,
            alert_log_cap: 50,
        }
    }
}

/// Classification of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertLevel {
    /// Below the warning ratio, or monitoring unavailable
    Normal,
    /// Between warning and critical
    Warning,
    /// At or above critical
    Critical,
    /// At or above emergency (a critical alert)
    Emergency,
}

impl AlertLevel {
    /// Whether this level fires the critical branch
    #[inline]
    #[must_use]
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Critical | Self::Emergency)
    }
}

/// Alert record emitted by an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAlert {
    /// Severity
    pub level: AlertLevel,
    /// `heap_used / heap_total` at evaluation time
    pub usage_ratio: f64,
    /// The evaluated sample
    pub sample: MemorySample,
    /// Evaluation time
    pub at: DateTime<Utc>,
}

/// Warning/critical classifier
#[derive(Debug)]
pub struct ThresholdPolicy {
    config: ThresholdConfig,
    alerts: Mutex<VecDeque<MemoryAlert>>,
}

impl ThresholdPolicy {
    /// Create a policy with validated thresholds
    ///
    /// # Errors
    /// `MonitorError::InvalidConfig` when the ratios are out of order
    pub fn new(config: ThresholdConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        Ok(Self {
            config,
            alerts: Mutex::new(VecDeque::new()),
        })
    }

    /// Policy thresholds
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Classify without side effects
    #[must_use]
    pub fn classify(&self, sample: &MemorySample) -> AlertLevel {
        let Some(ratio) = sample.usage_ratio() else {
            return AlertLevel::Normal;
        };
        if ratio >= self.config.emergency {
            AlertLevel::Emergency
        } else if ratio >= self.config.critical {
            AlertLevel::Critical
        } else if ratio >= self.config.warning {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }

    /// Evaluate `sample`, firing at most one of the two callbacks.
    ///
    /// Critical takes precedence over warning. No-op when monitoring is
    /// unavailable (`heap_total == 0`). Returns the recorded alert, if any.
    pub fn evaluate<W, C>(&self, sample: &MemorySample, on_warning: W, on_critical: C) -> Option<MemoryAlert>
    where
        W: FnOnce(&MemoryAlert),
        C: FnOnce(&MemoryAlert),
    {
        let ratio = sample.usage_ratio()?;
        let level = self.classify(sample);
        if level == AlertLevel::Normal {
            return None;
        }

        let alert = MemoryAlert {
            level,
            usage_ratio: ratio,
            sample: *sample,
            at: Utc::now(),
        };

        if level.is_critical() {
            tracing::error!(
                level = ?level,
                usage_ratio = ratio,
                heap_used = sample.heap_used,
                heap_total = sample.heap_total,
                "critical memory usage"
            );
            on_critical(&alert);
        } else {
            tracing::warn!(
                usage_ratio = ratio,
                heap_used = sample.heap_used,
                heap_total = sample.heap_total,
                "high memory usage"
            );
            on_warning(&alert);
        }

        let mut alerts = self.alerts.lock();
        alerts.push_back(alert.clone());
        while alerts.len() > self.config.alert_log_cap.max(1) {
            alerts.pop_front();
        }

        Some(alert)
    }

    /// Recorded alerts, oldest first
    #[must_use]
    pub fn alerts(&self) -> Vec<MemoryAlert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Drop recorded alerts
    pub fn clear_alerts(&self) {
        self.alerts.lock().clear();
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            config: ThresholdConfig::default(),
            alerts: Mutex::new(VecDeque::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn run(policy: &ThresholdPolicy, used: u64, total: u64) -> (Option<MemoryAlert>, bool, bool) {
        let warned = Cell::new(false);
        let critical = Cell::new(false);
        let alert = policy.evaluate(
            &MemorySample::with_usage(used, total),
            |_| warned.set(true),
            |_| critical.set(true),
        );
        (alert, warned.get(), critical.get())
    }

    #[test]
    fn unavailable_monitoring_is_noop() {
        let policy = ThresholdPolicy::default();
        let (alert, warned, critical) = run(&policy, 0, 0);
        assert!(alert.is_none());
        assert!(!warned && !critical);
        assert!(policy.alerts().is_empty());
    }

    #[test]
    fn below_warning_is_quiet() {
        let policy = ThresholdPolicy::default();
        let (alert, warned, critical) = run(&policy, 79, 100);
        assert!(alert.is_none());
        assert!(!warned && !critical);
    }

    #[test]
    fn warning_fires_only_warning() {
        let policy = ThresholdPolicy::default();
        let (alert, warned, critical) = run(&policy, 80, 100);
        assert_eq!(alert.unwrap().level, AlertLevel::Warning);
        assert!(warned);
        assert!(!critical);
    }

    #[test]
    fn critical_takes_precedence() {
        let policy = ThresholdPolicy::default();
        let (alert, warned, critical) = run(&policy, 92, 100);
        assert_eq!(alert.unwrap().level, AlertLevel::Critical);
        assert!(!warned);
        assert!(critical);

        let (alert, warned, critical) = run(&policy, 99, 100);
        assert_eq!(alert.unwrap().level, AlertLevel::Emergency);
        assert!(!warned);
        assert!(critical);
        assert_eq!(policy.alerts().len(), 2);
    }

    #[test]
    fn alert_log_is_bounded() {
        let policy = ThresholdPolicy::new(ThresholdConfig {
            alert_log_cap: 3,
            ..ThresholdConfig::default()
        })
        .unwrap();
        for _ in 0..10 {
            run(&policy, 85, 100);
        }
        assert_eq!(policy.alerts().len(), 3);
        policy.clear_alerts();
        assert!(policy.alerts().is_empty());
    }

    #[test]
    fn out_of_order_thresholds_rejected() {
        let config = ThresholdConfig {
            warning: 0.95,
            critical: 0.9,
            ..ThresholdConfig::default()
        };
        assert!(matches!(ThresholdPolicy::new(config), Err(MonitorError::InvalidConfig(_))));
    }
}
