//! Validated push event envelope.

use crate::{EventType, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain fields of an event, everything except the envelope fields.
pub type Payload = serde_json::Map<String, Value>;

/// Wire names of the envelope, in both accepted spellings. These are
/// lifted out of the record and never appear in [`Payload`].
pub const ENVELOPE_FIELDS: [&str; 6] = [
    "type",
    "tenantId",
    "tenant_id",
    "entityId",
    "entity_id",
    "timestamp",
];

/// Whether `name` is an envelope field rather than a payload field.
pub fn is_envelope_field(name: &str) -> bool {
    ENVELOPE_FIELDS.contains(&name)
}

/// A push event that passed validation.
///
/// Events are ephemeral: created from a raw push payload, consumed once by
/// the coordinator and every subscribed handler, then dropped. The tenant is
/// guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: Timestamp,
}

impl Event {
    /// Look up a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Whether the payload carries a non-null value for `name`.
    pub fn has_field(&self, name: &str) -> bool {
        matches!(self.payload.get(name), Some(v) if !v.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn sample() -> Event {
        let mut payload = Payload::new();
        payload.insert("amount".to_string(), json!(42.5));
        payload.insert("note".to_string(), Value::Null);
        Event {
            event_type: EventType::new("payment:completed"),
            tenant_id: TenantId::new("R1"),
            entity_id: Some("P9".to_string()),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_field_lookup() {
        let event = sample();
        assert_eq!(event.field("amount"), Some(&json!(42.5)));
        assert!(event.has_field("amount"));
        assert!(!event.has_field("note"));
        assert!(!event.has_field("missing"));
    }

    #[test]
    fn test_envelope_fields() {
        assert!(is_envelope_field("entityId"));
        assert!(is_envelope_field("tenant_id"));
        assert!(!is_envelope_field("amount"));
    }

    #[test]
    fn test_serializes_with_wire_names() {
        let json = serde_json::to_value(sample()).expect("serialize");
        assert_eq!(json["type"], "payment:completed");
        assert_eq!(json["tenantId"], "R1");
        assert_eq!(json["entityId"], "P9");
    }
}
