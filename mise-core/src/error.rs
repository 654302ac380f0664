//! Error types for MISE operations

use crate::{ConsumerLabel, DomainName, EventType, TenantId};
use thiserror::Error;

/// Inbound event validation errors.
///
/// Every variant carries the event type the payload arrived under so the
/// caller can log the drop with context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{event_type}: payload is not a structured record")]
    NotARecord { event_type: EventType },

    #[error("{event_type}: missing tenantId")]
    MissingTenant { event_type: EventType },

    #[error("{event_type}: required field missing: {field}")]
    RequiredFieldMissing { event_type: EventType, field: String },

    #[error("{event_type}: invalid value for {field}: {reason}")]
    InvalidField {
        event_type: EventType,
        field: String,
        reason: String,
    },
}

impl ValidationError {
    /// The event type of the rejected payload.
    pub fn event_type(&self) -> &EventType {
        match self {
            ValidationError::NotARecord { event_type }
            | ValidationError::MissingTenant { event_type }
            | ValidationError::RequiredFieldMissing { event_type, .. }
            | ValidationError::InvalidField { event_type, .. } => event_type,
        }
    }

    /// Human-readable reason without the event type prefix.
    pub fn reason(&self) -> String {
        match self {
            ValidationError::NotARecord { .. } => "payload is not a structured record".to_string(),
            ValidationError::MissingTenant { .. } => "missing tenantId".to_string(),
            ValidationError::RequiredFieldMissing { field, .. } => {
                format!("required field missing: {field}")
            }
            ValidationError::InvalidField { field, reason, .. } => {
                format!("invalid value for {field}: {reason}")
            }
        }
    }
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheStoreError {
    #[error("Cache store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Invalidation of {pattern} failed: {reason}")]
    InvalidationFailed { pattern: String, reason: String },

    #[error("Mutation of {key} failed: {reason}")]
    MutationFailed { key: String, reason: String },

    #[error("Cache store lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or {env})")]
    MissingConfigPath { env: &'static str },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Coordinator runtime errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Synchronization loop is not running")]
    LoopStopped,

    #[error("Pattern for tenant {requested} rejected by coordinator for tenant {current}")]
    TenantMismatch {
        current: TenantId,
        requested: TenantId,
    },

    #[error("Unknown domain: {domain}")]
    UnknownDomain { domain: DomainName },

    #[error("Debounce window of {window_ms}ms exceeds the {max_ms}ms limit")]
    WindowTooLong { window_ms: u128, max_ms: u64 },

    #[error("Consumer label {consumer} is reserved for the coordinator")]
    ReservedConsumer { consumer: ConsumerLabel },

    #[error("Synchronization loop failed: {reason}")]
    LoopFailed { reason: String },

    #[error("Failed to initialize tracing: {reason}")]
    TelemetryInit { reason: String },
}

/// Master error type for all MISE errors.
#[derive(Debug, Clone, Error)]
pub enum MiseError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cache store error: {0}")]
    CacheStore(#[from] CacheStoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type alias for MISE operations.
pub type MiseResult<T> = Result<T, MiseError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_event_type() {
        let err = ValidationError::MissingTenant {
            event_type: EventType::new("order:created"),
        };
        assert_eq!(err.event_type().as_str(), "order:created");
        assert_eq!(err.reason(), "missing tenantId");
        assert_eq!(err.to_string(), "order:created: missing tenantId");
    }

    #[test]
    fn test_required_field_reason() {
        let err = ValidationError::RequiredFieldMissing {
            event_type: EventType::new("payment:created"),
            field: "amount".to_string(),
        };
        assert!(err.reason().contains("amount"));
        assert!(err.to_string().starts_with("payment:created"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: MiseError = SyncError::LoopStopped.into();
        assert!(matches!(err, MiseError::Sync(SyncError::LoopStopped)));

        let err: MiseError = CacheStoreError::LockPoisoned.into();
        assert!(err.to_string().contains("lock poisoned"));
    }

    #[test]
    fn test_tenant_mismatch_display() {
        let err = SyncError::TenantMismatch {
            current: TenantId::new("R1"),
            requested: TenantId::new("R2"),
        };
        let msg = err.to_string();
        assert!(msg.contains("R1"));
        assert!(msg.contains("R2"));
    }
}
