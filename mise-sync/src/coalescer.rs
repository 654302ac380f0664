//! Trailing-edge invalidation coalescer.
//!
//! Pure state: the caller passes the current [`Instant`] in and asks which
//! batches are due. Nothing here sleeps or spawns, which keeps the timing
//! rules testable without a runtime.
//!
//! Per domain the state is `Idle` (no batch) or `Pending` (a batch with a
//! deadline). Every request unions its patterns into the batch and moves the
//! deadline to `now + window`, capped at `opened_at + max_wait` when the
//! domain has a cap.

use mise_cache::KeyPattern;
use mise_core::DomainName;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Latest a deadline is ever pushed out from its base instant.
const MAX_DEFERRAL: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Pending invalidations for one domain.
#[derive(Debug, Clone)]
pub struct InvalidationBatch {
    domain: DomainName,
    pending: BTreeSet<KeyPattern>,
    opened_at: Instant,
    deadline: Instant,
    max_wait: Option<Duration>,
    requests: u64,
}

impl InvalidationBatch {
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    pub fn pending(&self) -> &BTreeSet<KeyPattern> {
        &self.pending
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Requests folded into this batch.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    fn into_flush(self) -> FlushBatch {
        FlushBatch {
            domain: self.domain,
            patterns: self.pending,
            requests: self.requests,
        }
    }
}

/// A batch taken out of the coalescer, ready for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    pub domain: DomainName,
    pub patterns: BTreeSet<KeyPattern>,
    pub requests: u64,
}

#[derive(Debug, Default)]
pub struct InvalidationCoalescer {
    batches: HashMap<DomainName, InvalidationBatch>,
}

impl InvalidationCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `patterns` into `domain`'s batch and restart its timer.
    ///
    /// Returns the batch's new deadline.
    pub fn request_invalidation(
        &mut self,
        domain: &DomainName,
        patterns: impl IntoIterator<Item = KeyPattern>,
        window: Duration,
        max_wait: Option<Duration>,
        now: Instant,
    ) -> Instant {
        let batch = self
            .batches
            .entry(domain.clone())
            .or_insert_with(|| InvalidationBatch {
                domain: domain.clone(),
                pending: BTreeSet::new(),
                opened_at: now,
                deadline: now,
                max_wait,
                requests: 0,
            });

        batch.pending.extend(patterns);
        batch.requests += 1;
        batch.max_wait = max_wait;

        let trailing = deadline_after(now, window);
        batch.deadline = match batch.max_wait {
            Some(cap) => trailing.min(deadline_after(batch.opened_at, cap)),
            None => trailing,
        };
        batch.deadline
    }

    /// Earliest deadline across all pending batches.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batches.values().map(|b| b.deadline).min()
    }

    /// Remove and return every batch whose deadline is at or before `now`,
    /// earliest deadline first.
    pub fn take_due(&mut self, now: Instant) -> Vec<FlushBatch> {
        let mut due: Vec<DomainName> = self
            .batches
            .values()
            .filter(|b| b.deadline <= now)
            .map(|b| b.domain.clone())
            .collect();
        due.sort_by(|a, b| {
            let da = self.batches.get(a).map(|x| x.deadline);
            let db = self.batches.get(b).map(|x| x.deadline);
            da.cmp(&db).then_with(|| a.cmp(b))
        });

        due.iter()
            .filter_map(|domain| self.batches.remove(domain))
            .map(InvalidationBatch::into_flush)
            .collect()
    }

    /// Take `domain`'s pending batch, if any, plus `extra` for an immediate
    /// flush.
    pub fn force(
        &mut self,
        domain: &DomainName,
        extra: impl IntoIterator<Item = KeyPattern>,
    ) -> FlushBatch {
        let mut flush = match self.batches.remove(domain) {
            Some(batch) => batch.into_flush(),
            None => FlushBatch {
                domain: domain.clone(),
                patterns: BTreeSet::new(),
                requests: 0,
            },
        };
        flush.patterns.extend(extra);
        flush
    }

    /// Take every pending batch, ordered by domain.
    pub fn drain(&mut self) -> Vec<FlushBatch> {
        let mut batches: Vec<FlushBatch> = self
            .batches
            .drain()
            .map(|(_, b)| b.into_flush())
            .collect();
        batches.sort_by(|a, b| a.domain.cmp(&b.domain));
        batches
    }

    pub fn batch(&self, domain: &DomainName) -> Option<&InvalidationBatch> {
        self.batches.get(domain)
    }

    /// Number of domains with a pending batch.
    pub fn pending_len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_idle(&self) -> bool {
        self.batches.is_empty()
    }
}

/// `base + delay`, clamped so oversized durations cannot overflow.
fn deadline_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay.min(MAX_DEFERRAL)).unwrap_or(base)
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use mise_core::TenantId;
    use proptest::prelude::*;

    fn qualifier_strategy() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,6}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: requests spaced closer than the window collapse into
        /// one flush at `last + window` carrying the union of their patterns.
        #[test]
        fn prop_burst_flushes_once(
            window_ms in 50u64..5000,
            gaps in prop::collection::vec(0u64..1000, 0..12),
            qualifiers in prop::collection::vec(qualifier_strategy(), 1..13),
        ) {
            let window = Duration::from_millis(window_ms);
            let domain = DomainName::new("payments");
            let t0 = Instant::now();
            let mut coalescer = InvalidationCoalescer::new();
            let mut now = t0;
            let mut expected = BTreeSet::new();
            let mut requests = 0u64;

            let offsets = std::iter::once(0u64).chain(gaps.into_iter().map(|g| g % window_ms));
            for (offset, qualifier) in offsets.zip(qualifiers.iter().cycle()) {
                now += Duration::from_millis(offset);
                let p = KeyPattern::new(domain.clone(), TenantId::new("R1"), [qualifier.clone()]);
                expected.insert(p.clone());
                coalescer.request_invalidation(&domain, [p], window, None, now);
                requests += 1;
                prop_assert!(coalescer.take_due(now).is_empty());
            }

            let last = now;
            prop_assert!(coalescer.take_due(last + window - Duration::from_millis(1)).is_empty());
            let flushed = coalescer.take_due(last + window);
            prop_assert_eq!(flushed.len(), 1);
            prop_assert_eq!(&flushed[0].patterns, &expected);
            prop_assert_eq!(flushed[0].requests, requests);
            prop_assert!(coalescer.is_idle());
        }

        /// Property: with a cap, no batch stays open longer than the cap.
        #[test]
        fn prop_cap_bounds_latency(
            window_ms in 50u64..2000,
            factor in 1u32..5,
            gaps in prop::collection::vec(0u64..2000, 1..20),
        ) {
            let window = Duration::from_millis(window_ms);
            let cap = window * factor;
            let domain = DomainName::new("orders");
            let t0 = Instant::now();
            let mut coalescer = InvalidationCoalescer::new();
            let mut now = t0;

            for gap in gaps {
                now += Duration::from_millis(gap);
                for flush in coalescer.take_due(now) {
                    prop_assert!(!flush.patterns.is_empty());
                }
                let deadline = coalescer.request_invalidation(
                    &domain,
                    [KeyPattern::tenant_domain(domain.clone(), TenantId::new("R1"))],
                    window,
                    Some(cap),
                    now,
                );
                let batch = coalescer.batch(&domain).expect("pending batch");
                prop_assert!(deadline <= batch.opened_at() + cap);
                prop_assert!(deadline <= now + window);
            }
        }
    }
}
