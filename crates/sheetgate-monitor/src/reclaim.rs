//! Best-effort memory reclamation
//!
//! Nothing here guarantees memory is returned to the OS. `suggest` forwards a
//! hint to the probe, `clear_caches` asks registered collaborators to drop
//! optional memoization and drops dead registrations, `force` does both.

use crate::probe::MemoryProbe;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Collaborator holding optional memoization that can be dropped on demand
pub trait Reclaimable: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Drop every cached entry
    fn invalidate(&self);
}

/// Counters for reclamation activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// `suggest` calls (including those made by `force`)
    pub suggestions: u64,
    /// `clear_caches` calls (including those made by `force`)
    pub cache_clears: u64,
    /// `force` calls
    pub forced: u64,
}

/// Outcome of a forced reclamation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Collaborators invalidated
    pub caches_cleared: usize,
    /// Dead registrations dropped
    pub registrations_pruned: usize,
}

/// Reclamation coordinator
pub struct Reclaimer {
    probe: Arc<dyn MemoryProbe>,
    registry: Mutex<Vec<Weak<dyn Reclaimable>>>,
    generation: watch::Sender<u64>,
    suggestions: AtomicU64,
    cache_clears: AtomicU64,
    forced: AtomicU64,
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("registered", &self.registry.lock().len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Reclaimer {
    /// Create a reclaimer forwarding hints to `probe`
    #[must_use]
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            probe,
            registry: Mutex::new(Vec::new()),
            generation,
            suggestions: AtomicU64::new(0),
            cache_clears: AtomicU64::new(0),
            forced: AtomicU64::new(0),
        }
    }

    /// Register a cache to be invalidated by `clear_caches`.
    ///
    /// Only a weak reference is kept; dropping the collaborator unregisters it.
    pub fn register(&self, cache: &Arc<dyn Reclaimable>) {
        self.registry.lock().push(Arc::downgrade(cache));
    }

    /// Observe cache-invalidation generations
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Current invalidation generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Hint that reclamation would be useful now
    pub fn suggest(&self) {
        self.suggestions.fetch_add(1, Ordering::Relaxed);
        self.probe.request_reclaim();
        tracing::trace!("reclamation suggested");
    }

    /// Invalidate every live registered cache and bump the generation.
    ///
    /// Returns the number of caches invalidated.
    pub fn clear_caches(&self) -> usize {
        self.sweep().0
    }

    /// `suggest` + `clear_caches`, reporting pruned registrations
    pub fn force(&self) -> ReclaimReport {
        self.forced.fetch_add(1, Ordering::Relaxed);
        self.suggest();
        let (caches_cleared, registrations_pruned) = self.sweep();

        tracing::info!(caches_cleared, registrations_pruned, "forced reclamation");
        ReclaimReport {
            caches_cleared,
            registrations_pruned,
        }
    }

    /// Returns (caches invalidated, dead registrations dropped)
    fn sweep(&self) -> (usize, usize) {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
        let (live, pruned) = {
            let mut registry = self.registry.lock();
            let before = registry.len();
            registry.retain(|weak| weak.strong_count() > 0);
            let pruned = before - registry.len();
            let live: Vec<Arc<dyn Reclaimable>> = registry.iter().filter_map(Weak::upgrade).collect();
            (live, pruned)
        };

        for cache in &live {
            cache.invalidate();
            tracing::debug!(cache = cache.name(), "cache invalidated");
        }
        self.generation.send_modify(|generation| *generation += 1);
        (live.len(), pruned)
    }

    /// Registrations currently held, dead ones included until the next sweep
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    /// Activity counters
    #[must_use]
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            suggestions: self.suggestions.load(Ordering::Relaxed),
            cache_clears: self.cache_clears.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
        }
    }
}
