//! MISE Sync - Event-driven cache synchronization
//!
//! Keeps a dashboard's query-result cache consistent with server-side state
//! by listening to push events. Each event is validated, scoped to the
//! active tenant, and turned into coalesced invalidations of the cache keys
//! that depend on it.
//!
//! The entry point is [`SyncCoordinator`]; the other modules are the
//! pipeline stages it wires together and can be used on their own.

pub mod bindings;
pub mod channel;
pub mod coalescer;
pub mod coordinator;
pub mod dispatcher;
pub mod filter;
pub mod registry;
pub mod scope;
pub mod stats;
pub mod telemetry;
pub mod validator;

pub use bindings::{DomainBinding, DomainBindings, DomainSettings, OptimisticPatch, PatternTemplate};
pub use channel::{ChannelSubscriptionId, ConnectionState, LocalPushChannel, PushChannel, RawHandler};
pub use coalescer::{FlushBatch, InvalidationBatch, InvalidationCoalescer};
pub use coordinator::{SyncCoordinator, CACHE_SYNC_CONSUMER};
pub use dispatcher::{CacheInvalidationDispatcher, FlushReport};
pub use filter::InboundFilter;
pub use registry::{EventHandler, RegistrationTable, SubscriptionRegistry, SubscriptionToken};
pub use scope::is_in_scope;
pub use stats::{SyncStats, SyncStatsSnapshot};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use validator::EventValidator;
