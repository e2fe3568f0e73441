//! Memory introspection capability
//!
//! The engine never reaches for ambient process state directly. Whoever builds
//! it injects a [`MemoryProbe`]; hosts without introspection supply
//! [`NoopProbe`] and every downstream decision defaults to permissive.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

/// A single raw reading from a probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMemory {
    /// Bytes currently in use by the process
    pub heap_used: u64,
    /// Bytes the process may use before it is considered full
    pub heap_total: u64,
    /// Bytes reserved outside the tracked region
    pub external: u64,
}

impl RawMemory {
    /// Create a raw reading
    #[inline]
    #[must_use]
    pub fn new(heap_used: u64, heap_total: u64, external: u64) -> Self {
        Self {
            heap_used,
            heap_total,
            external,
        }
    }
}

/// Point-in-time memory sample as retained by the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Bytes currently in use
    pub heap_used: u64,
    /// Tracked capacity in bytes; `0` means monitoring is unavailable
    pub heap_total: u64,
    /// Bytes reserved outside the tracked region
    pub external: u64,
    /// Highest `heap_used` observed within the retained window
    pub peak_usage: u64,
    /// Monotonic index assigned by the monitor
    pub sample_index: u64,
}

impl MemorySample {
    /// Build a sample from a raw reading
    #[inline]
    #[must_use]
    pub fn from_raw(raw: RawMemory, peak_usage: u64, sample_index: u64) -> Self {
        Self {
            heap_used: raw.heap_used,
            heap_total: raw.heap_total,
            external: raw.external,
            peak_usage: peak_usage.max(raw.heap_used),
            sample_index,
        }
    }

    /// Sample with explicit used/total bytes (tests and manual callers)
    #[inline]
    #[must_use]
    pub fn with_usage(heap_used: u64, heap_total: u64) -> Self {
        Self {
            heap_used,
            heap_total,
            peak_usage: heap_used,
            ..Self::default()
        }
    }

    /// Whether the probe could not report memory at all
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.heap_total == 0
    }

    /// `heap_used / heap_total`, or `None` when monitoring is unavailable
    #[inline]
    #[must_use]
    pub fn usage_ratio(&self) -> Option<f64> {
        if self.is_unavailable() {
            None
        } else {
            Some(self.heap_used as f64 / self.heap_total as f64)
        }
    }

    /// Bytes still available under the tracked capacity
    #[inline]
    #[must_use]
    pub fn available(&self) -> u64 {
        self.heap_total.saturating_sub(self.heap_used)
    }
}

/// Capability for reading process memory and hinting reclamation
pub trait MemoryProbe: Send + Sync {
    /// Read current memory usage. All zeros means "unavailable".
    fn sample(&self) -> RawMemory;

    /// Ask the host to reclaim memory if it has a way to do so.
    fn request_reclaim(&self);
}

/// Probe for hosts without memory introspection
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

impl MemoryProbe for NoopProbe {
    fn sample(&self) -> RawMemory {
        RawMemory::default()
    }

    fn request_reclaim(&self) {}
}

/// Probe backed by `sysinfo`
///
/// `heap_used` is the resident set of the current process. `heap_total` is the
/// configured budget, or the machine's total memory when no budget is set.
/// `external` is the part of the virtual size that is not resident.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    budget: Option<u64>,
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe")
            .field("pid", &self.pid)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl SysinfoProbe {
    /// Probe the current process against total machine memory
    #[must_use]
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(error = %err, "process id unavailable, memory monitoring disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
            budget: None,
        }
    }

    /// Cap `heap_total` at an explicit byte budget
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, budget_bytes: u64) -> Self {
        self.budget = Some(budget_bytes);
        self
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> RawMemory {
        let Some(pid) = self.pid else {
            return RawMemory::default();
        };

        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return RawMemory::default();
        }
        let Some(process) = system.process(pid) else {
            return RawMemory::default();
        };
        let resident = process.memory();
        let virtual_size = process.virtual_memory();

        let heap_total = match self.budget {
            Some(budget) => budget,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };

        RawMemory {
            heap_used: resident,
            heap_total,
            external: virtual_size.saturating_sub(resident),
        }
    }

    fn request_reclaim(&self) {
        // The global allocator has no portable trim hook; dropping the probe's
        // own process table is the only thing this probe can release.
        let mut system = self.system.lock();
        *system = System::new();
        tracing::trace!("sysinfo probe released process table");
    }
}
