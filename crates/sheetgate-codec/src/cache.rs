//! Memoized sanitization using moka
//!
//! Header cells repeat across previews, validations and imports of the same
//! template, so their sanitized form is cached. The cache is optional state:
//! the reclaimer may invalidate it at any time.

use crate::security::{sanitize_with_report, Sanitized, SecurityError};
use moka::sync::Cache;
use sheetgate_monitor::Reclaimable;

/// Cache key: raw value plus the policy it was sanitized under
type Key = (String, usize, bool);

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// Sanitization cache
#[derive(Debug, Clone)]
pub struct SanitizeCache {
    inner: Cache<Key, Result<Sanitized, SecurityError>>,
}

impl SanitizeCache {
    /// Create a cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Sanitize through the cache
    ///
    /// # Errors
    /// `SecurityError::DangerousContent` when the value matches the denylist
    pub fn sanitize(&self, value: &str, max_length: usize, allow_html: bool) -> Result<Sanitized, SecurityError> {
        let key = (value.to_string(), max_length, allow_html);
        self.inner
            .get_with(key, || sanitize_with_report(value, max_length, allow_html))
    }

    /// Whether a sanitized form of `value` under this policy is cached
    #[must_use]
    pub fn contains(&self, value: &str, max_length: usize, allow_html: bool) -> bool {
        self.inner
            .contains_key(&(value.to_string(), max_length, allow_html))
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks();
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

impl Default for SanitizeCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Reclaimable for SanitizeCache {
    fn name(&self) -> &str {
        "sanitize-cache"
    }

    fn invalidate(&self) {
        self.inner.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetgate_monitor::{NoopProbe, Reclaimer};
    use std::sync::Arc;

    #[test]
    fn cached_result_matches_direct() {
        let cache = SanitizeCache::default();
        let first = cache.sanitize(" <b>Name</b> ", 100, false).unwrap();
        let second = cache.sanitize(" <b>Name</b> ", 100, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.value, "Name");
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn rejections_are_cached_too() {
        let cache = SanitizeCache::default();
        assert!(cache.sanitize("<script>", 100, false).is_err());
        assert!(cache.sanitize("<script>", 100, false).is_err());
    }

    #[test]
    fn reclaimer_clears_cache() {
        let cache = Arc::new(SanitizeCache::default());
        let reclaimer = Reclaimer::new(Arc::new(NoopProbe));
        let as_dyn: Arc<dyn Reclaimable> = cache.clone();
        reclaimer.register(&as_dyn);

        cache.sanitize("Age", 100, false).unwrap();
        assert!(cache.contains("Age", 100, false));

        reclaimer.clear_caches();
        assert!(!cache.contains("Age", 100, false));
    }
}
