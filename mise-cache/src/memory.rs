//! In-process cache store.
//!
//! Entries live in an ordered map so pattern invalidation is a range scan
//! starting at the pattern, the same shape as a prefix scan over a
//! tenant-first key space.

use crate::{CacheKey, CacheStats, CacheStore, KeyPattern};
use chrono::{DateTime, Utc};
use mise_core::CacheStoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A cached query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub cached_at: DateTime<Utc>,
    /// Set by invalidation, cleared by the next `put`.
    pub stale: bool,
}

/// Thread-safe in-memory [`CacheStore`].
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<BTreeMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    mutations: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh query result.
    pub fn put(&self, key: CacheKey, value: Value) -> Result<(), CacheStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheStoreError::LockPoisoned)?;
        entries.insert(
            key,
            CacheEntry {
                value,
                cached_at: Utc::now(),
                stale: false,
            },
        );
        Ok(())
    }

    /// Read an entry, stale or not. Counts a hit or a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CacheStoreError::LockPoisoned)?;
        let entry = entries.get(key).cloned();
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry)
    }

    /// Whether `key` is present and marked stale.
    pub fn is_stale(&self, key: &CacheKey) -> Result<bool, CacheStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CacheStoreError::LockPoisoned)?;
        Ok(entries.get(key).is_some_and(|e| e.stale))
    }

    pub fn stats(&self) -> Result<CacheStats, CacheStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CacheStoreError::LockPoisoned)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: entries.len() as u64,
            stale_entries: entries.values().filter(|e| e.stale).count() as u64,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
        })
    }
}

impl CacheStore for InMemoryCacheStore {
    fn invalidate(&self, pattern: &KeyPattern) -> Result<u64, CacheStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheStoreError::LockPoisoned)?;

        let start = pattern.range_start();
        let mut affected = 0;
        for (key, entry) in entries.range_mut((Bound::Included(start), Bound::Unbounded)) {
            if !pattern.matches(key) {
                break;
            }
            entry.stale = true;
            affected += 1;
        }

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(affected)
    }

    fn mutate(
        &self,
        key: &CacheKey,
        updater: &dyn Fn(&Value) -> Value,
    ) -> Result<bool, CacheStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheStoreError::LockPoisoned)?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = updater(&entry.value);
                entry.cached_at = Utc::now();
                self.mutations.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
