//! Cache layer contract with strict tenant scoping.
//!
//! This crate defines what the synchronizer needs from a query-result cache:
//! tenant-scoped keys, prefix patterns over them, and a store that can mark
//! matching entries stale or patch one entry in place.
//!
//! # Tenant Isolation
//!
//! [`CacheKey`] and [`KeyPattern`] cannot be constructed without a tenant,
//! and pattern matching compares whole segments. A pattern built for one
//! restaurant cannot reach another restaurant's entries.
//!
//! # Example
//!
//! ```ignore
//! let store = InMemoryCacheStore::new();
//! store.put(CacheKey::new("payments".into(), "R1".into(), ["list"]), json!([]))?;
//!
//! // Mark everything R1 has cached for payments as stale
//! store.invalidate(&KeyPattern::tenant_domain("payments".into(), "R1".into()))?;
//! ```

pub mod key;
pub mod memory;
pub mod store;

pub use key::{CacheKey, KeyPattern};
pub use memory::{CacheEntry, InMemoryCacheStore};
pub use store::{CacheStats, CacheStore};
