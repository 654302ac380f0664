//! Cache store contract.
//!
//! The coordinator's relationship with the cache is write-only: it marks
//! entries stale and patches entries in place, it never reads them. Whoever
//! renders the data observes staleness and refetches.

use crate::{CacheKey, KeyPattern};
use mise_core::CacheStoreError;
use serde_json::Value;

/// Key-addressed query-result cache.
///
/// Both operations are synchronous and must be idempotent in effect:
/// invalidating an already-stale entry changes nothing observable.
/// Implementations must be thread-safe.
pub trait CacheStore: Send + Sync {
    /// Mark every entry matched by `pattern` as stale.
    ///
    /// Returns the number of entries affected.
    fn invalidate(&self, pattern: &KeyPattern) -> Result<u64, CacheStoreError>;

    /// Replace the value stored under `key` with `updater(old)`.
    ///
    /// Absent entries are left absent. Returns whether an entry was updated.
    fn mutate(
        &self,
        key: &CacheKey,
        updater: &dyn Fn(&Value) -> Value,
    ) -> Result<bool, CacheStoreError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Entries currently marked stale.
    pub stale_entries: u64,
    /// Number of `invalidate` calls served.
    pub invalidations: u64,
    /// Number of entries changed by `mutate`.
    pub mutations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
