//! Tenant scope filter.
//!
//! The only cross-tenant isolation boundary in the coordinator. Nothing
//! downstream re-checks tenant identity, so this must run before any cache
//! side effect.

use mise_core::{Event, TenantId};

/// Whether `event` belongs to the tenant the consumer is looking at.
pub fn is_in_scope(event: &Event, current_tenant_id: &TenantId) -> bool {
    &event.tenant_id == current_tenant_id
}
