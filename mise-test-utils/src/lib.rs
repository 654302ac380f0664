//! MISE Test Utilities
//!
//! Centralized test infrastructure for the MISE workspace:
//! - A recording cache store with failure injection
//! - Proptest generators for identifiers, patterns and event timing
//! - Configuration and payload fixtures for the restaurant scenarios
//! - Custom assertions over recorded invalidations

pub use mise_cache::{CacheKey, CacheStats, CacheStore, InMemoryCacheStore, KeyPattern};
pub use mise_core::{
    CacheStoreError, ConsumerLabel, DomainName, EventType, MiseError, MiseResult, SyncConfig,
    TenantId,
};

use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// RECORDING STORE
// ============================================================================

/// One `invalidate` call as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationCall {
    pub pattern: KeyPattern,
    pub at: Instant,
    pub succeeded: bool,
}

/// One `mutate` call as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationCall {
    pub key: CacheKey,
    pub at: Instant,
    pub applied: bool,
}

/// In-memory store that records every call with the (tokio) time it
/// happened. Patterns registered with [`RecordingCacheStore::fail_on`]
/// are rejected.
#[derive(Debug, Default)]
pub struct RecordingCacheStore {
    inner: InMemoryCacheStore,
    invalidations: Mutex<Vec<InvalidationCall>>,
    mutations: Mutex<Vec<MutationCall>>,
    failing: Mutex<HashSet<KeyPattern>>,
}

impl RecordingCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backing store, for seeding and reading entries.
    pub fn inner(&self) -> &InMemoryCacheStore {
        &self.inner
    }

    /// Make every future `invalidate(pattern)` fail.
    pub fn fail_on(&self, pattern: KeyPattern) {
        lock(&self.failing).insert(pattern);
    }

    pub fn invalidations(&self) -> Vec<InvalidationCall> {
        lock(&self.invalidations).clone()
    }

    pub fn mutations(&self) -> Vec<MutationCall> {
        lock(&self.mutations).clone()
    }

    /// Patterns successfully invalidated, deduplicated.
    pub fn invalidated_patterns(&self) -> BTreeSet<KeyPattern> {
        lock(&self.invalidations)
            .iter()
            .filter(|c| c.succeeded)
            .map(|c| c.pattern.clone())
            .collect()
    }

    /// Distinct times (as offsets from `start`) at which invalidations
    /// happened, ascending.
    pub fn flush_offsets(&self, start: Instant) -> Vec<Duration> {
        let offsets: BTreeSet<Duration> = lock(&self.invalidations)
            .iter()
            .map(|c| c.at.saturating_duration_since(start))
            .collect();
        offsets.into_iter().collect()
    }
}

impl CacheStore for RecordingCacheStore {
    fn invalidate(&self, pattern: &KeyPattern) -> Result<u64, CacheStoreError> {
        let rejected = lock(&self.failing).contains(pattern);
        lock(&self.invalidations).push(InvalidationCall {
            pattern: pattern.clone(),
            at: Instant::now(),
            succeeded: !rejected,
        });

        if rejected {
            return Err(CacheStoreError::InvalidationFailed {
                pattern: pattern.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.invalidate(pattern)
    }

    fn mutate(
        &self,
        key: &CacheKey,
        updater: &dyn Fn(&Value) -> Value,
    ) -> Result<bool, CacheStoreError> {
        let applied = self.inner.mutate(key, updater)?;
        lock(&self.mutations).push(MutationCall {
            key: key.clone(),
            at: Instant::now(),
            applied,
        });
        Ok(applied)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating MISE values.

    use super::*;
    use proptest::prelude::*;

    /// Generate a tenant id such as `R7`.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        (1u32..500).prop_map(|n| TenantId::new(format!("R{n}")))
    }

    /// Generate a key domain name.
    pub fn arb_domain_name() -> impl Strategy<Value = DomainName> {
        prop::sample::select(vec!["payments", "orders", "menu", "tables", "staff"])
            .prop_map(DomainName::new)
    }

    /// Generate a single key qualifier.
    pub fn arb_qualifier() -> impl Strategy<Value = String> {
        "[a-z0-9_-]{1,10}"
    }

    /// Generate a pattern scoped to `tenant_id`.
    pub fn arb_key_pattern_for(tenant_id: TenantId) -> impl Strategy<Value = KeyPattern> {
        (
            arb_domain_name(),
            prop::collection::vec(arb_qualifier(), 0..3),
        )
            .prop_map(move |(domain, qualifiers)| {
                KeyPattern::new(domain, tenant_id.clone(), qualifiers)
            })
    }

    /// Generate inter-arrival gaps (ms) that are all shorter than `window_ms`.
    pub fn arb_gaps_within(window_ms: u64, max_len: usize) -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(0..window_ms.max(1), 0..max_len)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the restaurant dashboard scenarios.

    use super::*;
    use serde_json::{json, Map};

    /// Tenant the fixture coordinators act for.
    pub const TENANT: &str = "R1";

    /// Configuration for tenant R1 with `payments` (2000 ms) and `orders`
    /// (1000 ms) domains.
    pub fn restaurant_config() -> SyncConfig {
        restaurant_config_with(false, None)
    }

    /// Like [`restaurant_config`], with reconnect resync and an optional
    /// max-wait factor on the `orders` domain.
    pub fn restaurant_config_with(resync_on_reconnect: bool, orders_max_wait: Option<u32>) -> SyncConfig {
        let max_wait = orders_max_wait
            .map(|k| format!("max_wait_factor = {k}\n"))
            .unwrap_or_default();
        let doc = format!(
            r#"
tenant_id = "{TENANT}"
resync_on_reconnect = {resync_on_reconnect}

[[domains]]
name = "payments"
window_ms = 2000

[[domains.events]]
event_type = "payment:created"
patterns = ["payments/list", "payments/detail/{{entity_id}}"]
required_fields = ["amount"]

[[domains.events]]
event_type = "payment:completed"
patterns = ["payments/list", "payments/detail/{{entity_id}}", "orders/summary"]

[domains.events.optimistic]
key = "payments/detail/{{entity_id}}"
fields = ["status"]

[[domains.events]]
event_type = "payment:failed"
patterns = ["payments/list"]

[[domains.events]]
event_type = "payment:refunded"
patterns = ["payments/list"]

[[domains]]
name = "orders"
window_ms = 1000
{max_wait}
[[domains.events]]
event_type = "order:created"
patterns = ["orders/list"]
"#
        );
        match SyncConfig::from_toml_str(&doc) {
            Ok(config) => config,
            Err(e) => panic!("fixture config must be valid: {e}"),
        }
    }

    /// Build a raw push payload. `fields` must be a JSON object.
    pub fn raw_event(
        event_type: &str,
        tenant_id: Option<&str>,
        entity_id: Option<&str>,
        fields: Value,
    ) -> Value {
        let mut record = Map::new();
        record.insert("type".to_string(), json!(event_type));
        if let Some(tenant_id) = tenant_id {
            record.insert("tenantId".to_string(), json!(tenant_id));
        }
        if let Some(entity_id) = entity_id {
            record.insert("entityId".to_string(), json!(entity_id));
        }
        if let Value::Object(extra) = fields {
            record.extend(extra);
        }
        Value::Object(record)
    }

    /// A `payment:created` payload with an amount.
    pub fn payment_created(tenant_id: &str, payment_id: &str, amount: i64) -> Value {
        raw_event(
            "payment:created",
            Some(tenant_id),
            Some(payment_id),
            json!({ "amount": amount }),
        )
    }

    /// Pattern `domain/R1/qualifiers...`.
    pub fn tenant_pattern(domain: &str, qualifiers: &[&str]) -> KeyPattern {
        KeyPattern::new(
            DomainName::new(domain),
            TenantId::new(TENANT),
            qualifiers.iter().copied(),
        )
    }

    /// Key `domain/R1/qualifiers...`.
    pub fn tenant_key(domain: &str, qualifiers: &[&str]) -> CacheKey {
        CacheKey::new(
            DomainName::new(domain),
            TenantId::new(TENANT),
            qualifiers.iter().copied(),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over what a [`RecordingCacheStore`] saw.

    use super::*;

    /// Assert that no invalidation ever touched `tenant_id`.
    #[track_caller]
    pub fn assert_tenant_untouched(store: &RecordingCacheStore, tenant_id: &TenantId) {
        let leaked: Vec<String> = store
            .invalidations()
            .iter()
            .filter(|c| c.pattern.tenant_id() == tenant_id)
            .map(|c| c.pattern.to_string())
            .collect();
        assert!(leaked.is_empty(), "Invalidations leaked to {tenant_id}: {leaked:?}");
    }

    /// Assert that invalidations happened exactly at `expected_ms` offsets
    /// from `start`.
    #[track_caller]
    pub fn assert_flushed_at(store: &RecordingCacheStore, start: Instant, expected_ms: &[u64]) {
        let actual: Vec<u64> = store
            .flush_offsets(start)
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(actual, expected_ms, "Unexpected flush times (ms)");
    }

    /// Assert that a `MiseResult` is a `Sync` error.
    #[track_caller]
    pub fn assert_sync_error<T: std::fmt::Debug>(result: &MiseResult<T>) {
        match result {
            Err(MiseError::Sync(_)) => {}
            other => panic!("Expected Sync error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
