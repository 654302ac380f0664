//! Event envelope validation.
//!
//! Turns an untyped push payload into an [`Event`]. A payload that fails
//! any check is rejected with a [`ValidationError`]; the caller logs and
//! drops it and keeps processing.

use chrono::{DateTime, Utc};
use mise_core::{
    is_envelope_field, Event, EventType, Payload, SyncConfig, TenantId, ValidationError,
};
use serde_json::Value;
use std::collections::HashMap;

const TENANT_FIELDS: [&str; 2] = ["tenantId", "tenant_id"];
const ENTITY_FIELDS: [&str; 2] = ["entityId", "entity_id"];
const TIMESTAMP_FIELD: &str = "timestamp";
const TYPE_FIELD: &str = "type";

/// Validates raw payloads against per-event-type field requirements.
#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    required: HashMap<EventType, Vec<String>>,
}

impl EventValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `fields` on every payload of `event_type`.
    pub fn with_required_fields<I, S>(mut self, event_type: EventType, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.required.entry(event_type).or_default();
        for field in fields {
            let field = field.into();
            if !entry.contains(&field) {
                entry.push(field);
            }
        }
        self
    }

    /// Collect requirements from every binding in every domain.
    pub fn from_config(config: &SyncConfig) -> Self {
        config
            .domains
            .iter()
            .flat_map(|domain| domain.events.iter())
            .fold(Self::new(), |validator, binding| {
                validator
                    .with_required_fields(binding.event_type.clone(), binding.all_required_fields())
            })
    }

    /// Fields required for `event_type`.
    pub fn required_fields(&self, event_type: &EventType) -> &[String] {
        self.required
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn validate(&self, event_type: &EventType, raw: &Value) -> Result<Event, ValidationError> {
        let record = raw.as_object().ok_or_else(|| ValidationError::NotARecord {
            event_type: event_type.clone(),
        })?;

        if let Some(declared) = record.get(TYPE_FIELD) {
            if declared.as_str() != Some(event_type.as_str()) {
                return Err(invalid(
                    event_type,
                    TYPE_FIELD,
                    format!("payload declares {declared}"),
                ));
            }
        }

        let tenant_id = match first_present(record, &TENANT_FIELDS) {
            Some(Value::String(s)) if !s.trim().is_empty() => TenantId::new(s.as_str()),
            Some(Value::String(_)) | None => {
                return Err(ValidationError::MissingTenant {
                    event_type: event_type.clone(),
                })
            }
            Some(_) => return Err(invalid(event_type, "tenantId", "expected a string")),
        };

        let entity_id = match first_present(record, &ENTITY_FIELDS) {
            None => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => return Err(invalid(event_type, "entityId", "expected a string or number")),
        };

        let timestamp = match record.get(TIMESTAMP_FIELD) {
            None | Some(Value::Null) => Utc::now(),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| invalid(event_type, TIMESTAMP_FIELD, e.to_string()))?,
            Some(_) => return Err(invalid(event_type, TIMESTAMP_FIELD, "expected an RFC 3339 string")),
        };

        let payload: Payload = record
            .iter()
            .filter(|(k, _)| !is_envelope_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for field in self.required_fields(event_type) {
            if matches!(payload.get(field), None | Some(Value::Null)) {
                return Err(ValidationError::RequiredFieldMissing {
                    event_type: event_type.clone(),
                    field: field.clone(),
                });
            }
        }

        Ok(Event {
            event_type: event_type.clone(),
            tenant_id,
            entity_id,
            payload,
            timestamp,
        })
    }
}

/// The first of `names` present with a non-null value.
fn first_present<'a>(record: &'a Payload, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| record.get(*name))
        .find(|v| !v.is_null())
}

fn invalid(event_type: &EventType, field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        event_type: event_type.clone(),
        field: field.to_string(),
        reason: reason.into(),
    }
}
