//! Inbound filter: validation followed by tenant scoping.
//!
//! Every push message routed by the registry runs through this once, before
//! any consumer sees it. Malformed payloads and other tenants' events stop
//! here and never reach handler code.

use crate::scope::is_in_scope;
use crate::stats::SyncStats;
use crate::validator::EventValidator;
use mise_core::{Event, EventType, TenantId};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct InboundFilter {
    validator: EventValidator,
    tenant_id: TenantId,
    stats: Arc<SyncStats>,
}

impl InboundFilter {
    pub fn new(validator: EventValidator, tenant_id: TenantId, stats: Arc<SyncStats>) -> Self {
        Self {
            validator,
            tenant_id,
            stats,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Validate and scope one raw push message.
    ///
    /// Returns `None` when the payload must not reach any consumer.
    pub fn admit(&self, event_type: &EventType, raw: &Value) -> Option<Event> {
        self.stats.record_received();

        let event = match self.validator.validate(event_type, raw) {
            Ok(event) => event,
            Err(err) => {
                self.stats.record_malformed();
                debug!(
                    event_type = %err.event_type(),
                    reason = %err.reason(),
                    "Dropping malformed event"
                );
                return None;
            }
        };

        if !is_in_scope(&event, &self.tenant_id) {
            self.stats.record_out_of_scope();
            debug!(
                event_type = %event.event_type,
                event_tenant_id = %event.tenant_id,
                tenant_id = %self.tenant_id,
                "Skipping event for another tenant"
            );
            return None;
        }

        Some(event)
    }
}
