//! Cache invalidation dispatcher.
//!
//! Executes one flush: every pattern of a batch is handed to the cache
//! store before `flush` returns. A failing pattern is logged and skipped;
//! the rest of the batch still goes through. No retries.

use crate::stats::SyncStats;
use mise_cache::{CacheStore, KeyPattern};
use mise_core::{CacheStoreError, DomainName};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub domain: DomainName,
    /// Patterns handed to the store.
    pub patterns: usize,
    /// Patterns the store accepted.
    pub invalidated: usize,
    /// Entries marked stale, as reported by the store.
    pub entries: u64,
    pub failures: Vec<(KeyPattern, CacheStoreError)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct CacheInvalidationDispatcher {
    store: Arc<dyn CacheStore>,
    stats: Arc<SyncStats>,
}

impl CacheInvalidationDispatcher {
    pub fn new(store: Arc<dyn CacheStore>, stats: Arc<SyncStats>) -> Self {
        Self { store, stats }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn flush(&self, domain: &DomainName, patterns: &BTreeSet<KeyPattern>) -> FlushReport {
        let mut report = FlushReport {
            domain: domain.clone(),
            patterns: patterns.len(),
            invalidated: 0,
            entries: 0,
            failures: Vec::new(),
        };

        for pattern in patterns {
            match self.store.invalidate(pattern) {
                Ok(entries) => {
                    report.invalidated += 1;
                    report.entries += entries;
                }
                Err(err) => {
                    error!(
                        domain = %domain,
                        pattern = %pattern,
                        error = %err,
                        "Cache invalidation failed"
                    );
                    report.failures.push((pattern.clone(), err));
                }
            }
        }

        self.stats.record_flush(
            report.invalidated as u64,
            report.entries,
            report.failures.len() as u64,
        );
        info!(
            domain = %domain,
            patterns = report.patterns,
            entries = report.entries,
            failures = report.failures.len(),
            "Flushed invalidation batch"
        );
        report
    }
}
