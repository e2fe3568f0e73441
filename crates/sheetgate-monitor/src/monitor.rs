//! Interval memory sampling with bounded history
//!
//! The sampling task is the only writer of the history. Readers take clones.

use crate::error::MonitorError;
use crate::probe::{MemoryProbe, MemorySample};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Dead band for trend classification (1 MiB per sample)
const TREND_DEAD_BAND: f64 = 1024.0 * 1024.0;

/// Monitor configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between samples
    #[serde(with = "duration_millis")]
    pub sample_interval: Duration,
    /// Maximum retained samples
    pub history_cap: usize,
}

impl MonitorConfig {
    /// With sample interval
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// With history cap
    #[inline]
    #[must_use]
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            history_cap: 100,
        }
    }
}

/// Direction of memory usage across retained history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    /// Usage grows by more than the dead band per sample
    Rising,
    /// Usage shrinks by more than the dead band per sample
    Falling,
    /// Within the dead band, or too few samples
    Stable,
}

#[derive(Debug, Default)]
struct MonitorShared {
    history: RwLock<VecDeque<MemorySample>>,
    next_index: AtomicU64,
}

impl MonitorShared {
    fn peak(&self) -> u64 {
        self.history
            .read()
            .iter()
            .map(|s| s.heap_used)
            .max()
            .unwrap_or(0)
    }

    /// Append one reading, trimming the oldest entries beyond `cap`.
    fn record(&self, probe: &dyn MemoryProbe, cap: usize) -> MemorySample {
        let raw = probe.sample();
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);

        let mut history = self.history.write();
        let peak = history.iter().map(|s| s.heap_used).max().unwrap_or(0);
        let sample = MemorySample::from_raw(raw, peak, index);
        history.push_back(sample);
        while history.len() > cap.max(1) {
            history.pop_front();
        }
        sample
    }
}

/// Periodic memory sampler
///
/// Owned by whoever constructs the engine; `start`/`stop` are explicit.
pub struct ResourceMonitor {
    probe: Arc<dyn MemoryProbe>,
    config: MonitorConfig,
    shared: Arc<MonitorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("samples", &self.shared.history.read().len())
            .finish()
    }
}

impl ResourceMonitor {
    /// Create a stopped monitor over `probe`
    #[must_use]
    pub fn new(probe: Arc<dyn MemoryProbe>, config: MonitorConfig) -> Self {
        Self {
            probe,
            config,
            shared: Arc::new(MonitorShared::default()),
            task: Mutex::new(None),
        }
    }

    /// Monitor configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The injected probe
    #[inline]
    #[must_use]
    pub fn probe(&self) -> &Arc<dyn MemoryProbe> {
        &self.probe
    }

    /// Begin periodic sampling, invoking `callback` with every retained sample.
    ///
    /// # Errors
    /// - `MonitorError::AlreadyRunning` if sampling is active
    /// - `MonitorError::NoRuntime` outside a tokio runtime
    pub fn start<F>(&self, callback: F) -> Result<(), MonitorError>
    where
        F: Fn(MemorySample) + Send + Sync + 'static,
    {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(MonitorError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| MonitorError::NoRuntime(err.to_string()))?;

        let probe = Arc::clone(&self.probe);
        let shared = Arc::clone(&self.shared);
        let interval = self.config.sample_interval;
        let cap = self.config.history_cap;

        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = shared.record(probe.as_ref(), cap);
                tracing::trace!(
                    index = sample.sample_index,
                    heap_used = sample.heap_used,
                    heap_total = sample.heap_total,
                    "memory sample"
                );
                callback(sample);
            }
        }));

        tracing::debug!(interval_ms = interval.as_millis() as u64, cap, "resource monitor started");
        Ok(())
    }

    /// Halt sampling. History is kept.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            tracing::debug!("resource monitor stopped");
        }
    }

    /// Whether the sampling task is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Read memory now, outside the timer. Does not touch history.
    #[must_use]
    pub fn current_sample(&self) -> MemorySample {
        let raw = self.probe.sample();
        MemorySample::from_raw(
            raw,
            self.shared.peak(),
            self.shared.next_index.load(Ordering::Relaxed),
        )
    }

    /// Retained samples, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<MemorySample> {
        self.shared.history.read().iter().copied().collect()
    }

    /// Most recent retained sample
    #[must_use]
    pub fn latest(&self) -> Option<MemorySample> {
        self.shared.history.read().back().copied()
    }

    /// Highest `heap_used` within the retained window
    #[must_use]
    pub fn peak_usage(&self) -> u64 {
        self.shared.peak()
    }

    /// Usage direction across retained history
    #[must_use]
    pub fn trend(&self) -> Trend {
        let history = self.shared.history.read();
        if history.len() < 2 {
            return Trend::Stable;
        }
        let (Some(first), Some(last)) = (history.front(), history.back()) else {
            return Trend::Stable;
        };
        let steps = (history.len() - 1) as f64;
        let slope = (last.heap_used as f64 - first.heap_used as f64) / steps;
        if slope > TREND_DEAD_BAND {
            Trend::Rising
        } else if slope < -TREND_DEAD_BAND {
            Trend::Falling
        } else {
            Trend::Stable
        }
    }

    /// Clear retained history
    pub fn reset(&self) {
        self.shared.history.write().clear();
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
