//! Coordinator counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the inbound filter, the event loop and the
/// dispatcher.
#[derive(Debug, Default)]
pub struct SyncStats {
    received: AtomicU64,
    malformed: AtomicU64,
    out_of_scope: AtomicU64,
    delivered: AtomicU64,
    invalidation_requests: AtomicU64,
    flushes: AtomicU64,
    patterns_invalidated: AtomicU64,
    entries_invalidated: AtomicU64,
    store_failures: AtomicU64,
    optimistic_updates: AtomicU64,
    resyncs: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    /// Push messages routed to registered consumers, counted once each.
    pub received: u64,
    /// Payloads dropped by validation.
    pub malformed: u64,
    /// Valid events for another tenant.
    pub out_of_scope: u64,
    /// Handler invocations with a validated, in-scope event.
    pub delivered: u64,
    pub invalidation_requests: u64,
    pub flushes: u64,
    pub patterns_invalidated: u64,
    pub entries_invalidated: u64,
    pub store_failures: u64,
    pub optimistic_updates: u64,
    pub resyncs: u64,
}

impl SyncStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_scope(&self) {
        self.out_of_scope.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_request(&self) {
        self.invalidation_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// One dispatcher flush: `patterns` succeeded, touching `entries`.
    pub fn record_flush(&self, patterns: u64, entries: u64, failures: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.patterns_invalidated.fetch_add(patterns, Ordering::Relaxed);
        self.entries_invalidated.fetch_add(entries, Ordering::Relaxed);
        self.store_failures.fetch_add(failures, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_optimistic_update(&self) {
        self.optimistic_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            out_of_scope: self.out_of_scope.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            invalidation_requests: self.invalidation_requests.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            patterns_invalidated: self.patterns_invalidated.load(Ordering::Relaxed),
            entries_invalidated: self.entries_invalidated.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            optimistic_updates: self.optimistic_updates.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_accumulates() {
        let stats = SyncStats::default();
        stats.record_flush(3, 7, 0);
        stats.record_flush(1, 0, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.flushes, 2);
        assert_eq!(snapshot.patterns_invalidated, 4);
        assert_eq!(snapshot.entries_invalidated, 7);
        assert_eq!(snapshot.store_failures, 1);
    }
}
