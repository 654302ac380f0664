//! Compiled domain bindings.
//!
//! Turns the static [`SyncConfig`] into lookup tables keyed by event type.
//! Pattern templates are parsed once here; resolving them against an event
//! only substitutes the tenant and the entity id.

use mise_cache::{CacheKey, KeyPattern};
use mise_core::config::validate_template;
use mise_core::{
    ConfigError, DomainName, Event, EventType, SyncConfig, TenantId, ENTITY_ID_PLACEHOLDER,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    EntityId,
}

/// A parsed `keydomain[/qualifier...]` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternTemplate {
    key_domain: DomainName,
    qualifiers: Vec<TemplateSegment>,
}

impl PatternTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        validate_template("pattern", template)?;

        let mut segments = template.split('/');
        let key_domain = segments
            .next()
            .map(DomainName::new)
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "pattern".to_string(),
            })?;
        let qualifiers = segments
            .map(|segment| {
                if segment == ENTITY_ID_PLACEHOLDER {
                    TemplateSegment::EntityId
                } else {
                    TemplateSegment::Literal(segment.to_string())
                }
            })
            .collect();

        Ok(Self {
            key_domain,
            qualifiers,
        })
    }

    pub fn key_domain(&self) -> &DomainName {
        &self.key_domain
    }

    pub fn needs_entity_id(&self) -> bool {
        self.qualifiers.contains(&TemplateSegment::EntityId)
    }

    /// Resolve for `tenant_id`.
    ///
    /// Without an entity id the pattern stops just before the first
    /// placeholder, which widens the invalidation.
    pub fn resolve(&self, tenant_id: &TenantId, entity_id: Option<&str>) -> KeyPattern {
        let mut qualifiers = Vec::with_capacity(self.qualifiers.len());
        for segment in &self.qualifiers {
            match (segment, entity_id) {
                (TemplateSegment::Literal(s), _) => qualifiers.push(s.clone()),
                (TemplateSegment::EntityId, Some(id)) => qualifiers.push(id.to_string()),
                (TemplateSegment::EntityId, None) => break,
            }
        }
        KeyPattern::new(self.key_domain.clone(), tenant_id.clone(), qualifiers)
    }

    /// Resolve to a concrete key. `None` when a placeholder cannot be filled.
    pub fn resolve_key(&self, tenant_id: &TenantId, entity_id: Option<&str>) -> Option<CacheKey> {
        if entity_id.is_none() && self.needs_entity_id() {
            return None;
        }
        let pattern = self.resolve(tenant_id, entity_id);
        Some(pattern.range_start())
    }
}

/// Payload fields merged into one cached record ahead of the refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticPatch {
    key: PatternTemplate,
    fields: Vec<String>,
}

impl OptimisticPatch {
    /// Cache key to patch for `event`, if it can be resolved.
    pub fn key_for(&self, tenant_id: &TenantId, event: &Event) -> Option<CacheKey> {
        self.key.resolve_key(tenant_id, event.entity_id.as_deref())
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Merge the configured fields of `event` into `cached`.
    ///
    /// Values that are not JSON objects come back unchanged.
    pub fn apply(&self, cached: &Value, event: &Event) -> Value {
        let mut merged = cached.clone();
        if let Value::Object(record) = &mut merged {
            for field in &self.fields {
                if let Some(value) = event.field(field).filter(|v| !v.is_null()) {
                    record.insert(field.clone(), value.clone());
                }
            }
        }
        merged
    }
}

/// One event type's contribution to one batching domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainBinding {
    domain: DomainName,
    window: Duration,
    max_wait: Option<Duration>,
    patterns: Vec<PatternTemplate>,
    optimistic: Option<OptimisticPatch>,
}

impl DomainBinding {
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub fn optimistic(&self) -> Option<&OptimisticPatch> {
        self.optimistic.as_ref()
    }

    /// Every pattern this binding invalidates for `event`.
    pub fn patterns_for(&self, tenant_id: &TenantId, event: &Event) -> BTreeSet<KeyPattern> {
        self.patterns
            .iter()
            .map(|t| t.resolve(tenant_id, event.entity_id.as_deref()))
            .collect()
    }
}

/// Per-domain timing plus every key domain its bindings touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSettings {
    pub name: DomainName,
    pub window: Duration,
    pub max_wait: Option<Duration>,
    pub key_domains: BTreeSet<DomainName>,
}

impl DomainSettings {
    /// Tenant-wide patterns covering everything this domain invalidates.
    pub fn resync_patterns(&self, tenant_id: &TenantId) -> BTreeSet<KeyPattern> {
        self.key_domains
            .iter()
            .map(|d| KeyPattern::tenant_domain(d.clone(), tenant_id.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DomainBindings {
    tenant_id: TenantId,
    by_event: BTreeMap<EventType, Vec<DomainBinding>>,
    domains: Vec<DomainSettings>,
}

impl DomainBindings {
    /// Compile a configuration. Validates it first.
    pub fn compile(config: &SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut by_event: BTreeMap<EventType, Vec<DomainBinding>> = BTreeMap::new();
        let mut domains = Vec::with_capacity(config.domains.len());

        for domain in &config.domains {
            let mut key_domains = BTreeSet::new();
            key_domains.insert(domain.name.clone());

            for binding in &domain.events {
                let patterns = binding
                    .patterns
                    .iter()
                    .map(|t| PatternTemplate::parse(t))
                    .collect::<Result<Vec<_>, _>>()?;
                key_domains.extend(patterns.iter().map(|p| p.key_domain().clone()));

                let optimistic = match &binding.optimistic {
                    Some(update) => {
                        let key = PatternTemplate::parse(&update.key)?;
                        key_domains.insert(key.key_domain().clone());
                        Some(OptimisticPatch {
                            key,
                            fields: update.fields.clone(),
                        })
                    }
                    None => None,
                };

                by_event
                    .entry(binding.event_type.clone())
                    .or_default()
                    .push(DomainBinding {
                        domain: domain.name.clone(),
                        window: domain.window(),
                        max_wait: domain.max_wait(),
                        patterns,
                        optimistic,
                    });
            }

            domains.push(DomainSettings {
                name: domain.name.clone(),
                window: domain.window(),
                max_wait: domain.max_wait(),
                key_domains,
            });
        }

        Ok(Self {
            tenant_id: config.tenant_id.clone(),
            by_event,
            domains,
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn for_event(&self, event_type: &EventType) -> &[DomainBinding] {
        self.by_event
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.by_event.keys()
    }

    pub fn domain(&self, name: &DomainName) -> Option<&DomainSettings> {
        self.domains.iter().find(|d| &d.name == name)
    }

    pub fn domains(&self) -> &[DomainSettings] {
        &self.domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mise_core::Payload;
    use serde_json::json;

    const CONFIG: &str = r#"
tenant_id = "R1"

[[domains]]
name = "payments"
window_ms = 2000
max_wait_factor = 3

[[domains.events]]
event_type = "payment:completed"
patterns = ["payments/list", "payments/detail/{entity_id}", "orders/summary"]

[domains.events.optimistic]
key = "payments/detail/{entity_id}"
fields = ["status"]

[[domains]]
name = "orders"
window_ms = 1000

[[domains.events]]
event_type = "payment:completed"
patterns = ["orders"]
"#;

    fn event(entity_id: Option<&str>, payload: Value) -> Event {
        let payload: Payload = payload.as_object().cloned().unwrap_or_default();
        Event {
            event_type: EventType::new("payment:completed"),
            tenant_id: TenantId::new("R1"),
            entity_id: entity_id.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        }
    }

    fn encoded(patterns: &BTreeSet<KeyPattern>) -> Vec<String> {
        patterns.iter().map(KeyPattern::encode).collect()
    }

    fn bindings() -> DomainBindings {
        let config = SyncConfig::from_toml_str(CONFIG).expect("config");
        DomainBindings::compile(&config).expect("compile")
    }

    #[test]
    fn test_template_resolution_inserts_tenant() {
        let template = PatternTemplate::parse("payments/detail/{entity_id}").expect("parse");
        let tenant = TenantId::new("R1");
        assert_eq!(template.resolve(&tenant, Some("P9")).encode(), "payments/R1/detail/P9");
        assert_eq!(template.resolve(&tenant, None).encode(), "payments/R1/detail");
    }

    #[test]
    fn test_resolve_key_requires_entity_id() {
        let template = PatternTemplate::parse("payments/detail/{entity_id}").expect("parse");
        let tenant = TenantId::new("R1");
        assert!(template.resolve_key(&tenant, None).is_none());
        let key = template.resolve_key(&tenant, Some("P9")).expect("key");
        assert_eq!(key.encode(), "payments/R1/detail/P9");
    }

    #[test]
    fn test_event_feeds_multiple_domains() {
        let bindings = bindings();
        let for_event = bindings.for_event(&EventType::new("payment:completed"));
        let domains: Vec<&str> = for_event.iter().map(|b| b.domain().as_str()).collect();
        assert_eq!(domains, vec!["payments", "orders"]);
        assert_eq!(for_event[0].max_wait(), Some(Duration::from_millis(6000)));
        assert_eq!(for_event[1].max_wait(), None);
    }

    #[test]
    fn test_patterns_for_event() {
        let bindings = bindings();
        let binding = &bindings.for_event(&EventType::new("payment:completed"))[0];
        let tenant = bindings.tenant_id().clone();

        assert_eq!(
            encoded(&binding.patterns_for(&tenant, &event(Some("P9"), json!({})))),
            vec!["orders/R1/summary", "payments/R1/detail/P9", "payments/R1/list"]
        );
        assert_eq!(
            encoded(&binding.patterns_for(&tenant, &event(None, json!({})))),
            vec!["orders/R1/summary", "payments/R1/detail", "payments/R1/list"]
        );
    }

    #[test]
    fn test_unbound_event_has_no_bindings() {
        assert!(bindings().for_event(&EventType::new("menu:updated")).is_empty());
    }

    #[test]
    fn test_resync_patterns_cover_key_domains() {
        let bindings = bindings();
        let payments = bindings.domain(&DomainName::new("payments")).expect("payments");
        assert_eq!(
            encoded(&payments.resync_patterns(bindings.tenant_id())),
            vec!["orders/R1", "payments/R1"]
        );
    }

    #[test]
    fn test_optimistic_merge() {
        let bindings = bindings();
        let patch = bindings.for_event(&EventType::new("payment:completed"))[0]
            .optimistic()
            .expect("optimistic update");
        let e = event(Some("P9"), json!({"status": "completed", "amount": 10}));

        let merged = patch.apply(&json!({"status": "pending", "amount": 10, "id": "P9"}), &e);
        assert_eq!(merged, json!({"status": "completed", "amount": 10, "id": "P9"}));

        // Non-object values are left alone
        assert_eq!(patch.apply(&json!([1, 2]), &e), json!([1, 2]));
    }

    #[test]
    fn test_optimistic_merge_skips_null_fields() {
        let bindings = bindings();
        let patch = bindings.for_event(&EventType::new("payment:completed"))[0]
            .optimistic()
            .expect("optimistic update");
        let e = event(Some("P9"), json!({"status": null}));
        assert_eq!(
            patch.apply(&json!({"status": "pending"}), &e),
            json!({"status": "pending"})
        );
    }

    #[test]
    fn test_optimistic_key_for_event() {
        let bindings = bindings();
        let patch = bindings.for_event(&EventType::new("payment:completed"))[0]
            .optimistic()
            .expect("optimistic update");
        let tenant = bindings.tenant_id();
        assert!(patch.key_for(tenant, &event(None, json!({}))).is_none());
        assert_eq!(
            patch
                .key_for(tenant, &event(Some("P9"), json!({})))
                .map(|k| k.encode()),
            Some("payments/R1/detail/P9".to_string())
        );
    }
}
