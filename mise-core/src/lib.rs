//! MISE Core - Shared Types
//!
//! Identifiers, the inbound [`Event`] envelope, the error taxonomy and the
//! static synchronization configuration. All other crates depend on this.
//! This crate contains no coordination logic.

pub mod config;
pub mod error;
pub mod event;
pub mod identity;

pub use config::{
    DomainConfig, EventBinding, OptimisticUpdate, SyncConfig, CONFIG_PATH_ENV,
    ENTITY_ID_PLACEHOLDER, MAX_WINDOW_MS,
};
pub use error::{
    CacheStoreError, ConfigError, MiseError, MiseResult, SyncError, ValidationError,
};
pub use event::{is_envelope_field, Event, Payload, ENVELOPE_FIELDS};
pub use identity::{ConsumerLabel, DomainName, EventType, TenantId, Timestamp};
