//! Subscription registry.
//!
//! Enforces at most one live handler per `(event type, consumer)` pair.
//! Registering the same pair again replaces the previous handler, so
//! repeated mounts of a UI fragment never stack listeners.
//!
//! The registry attaches one route per event type to the push channel. A
//! route validates and scopes each push message once, then fans the event
//! out to every consumer registered for that type in registration order.
//! The route is detached when its last consumer leaves.
//!
//! Each registration yields a [`SubscriptionToken`] carrying a generation
//! number. Unsubscribing with a token only ever removes the registration it
//! was issued for; a token superseded by a later registration is stale and
//! unsubscribing with it leaves the newer handler in place.

use crate::channel::{ChannelSubscriptionId, PushChannel, RawHandler};
use crate::filter::InboundFilter;
use mise_core::{ConsumerLabel, Event, EventType};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Handler receiving validated, in-scope events.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Proof of one registration, required to tear it down.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    event_type: EventType,
    consumer: ConsumerLabel,
    generation: u64,
}

impl SubscriptionToken {
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn consumer(&self) -> &ConsumerLabel {
        &self.consumer
    }
}

struct Registration {
    generation: u64,
    handler: EventHandler,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Owned registration state.
///
/// Handed to a registry at construction; each coordinator owns its own
/// table, so independent coordinators never see each other's handlers.
#[derive(Debug, Default)]
pub struct RegistrationTable {
    entries: HashMap<(EventType, ConsumerLabel), Registration>,
    routes: HashMap<EventType, ChannelSubscriptionId>,
    next_generation: u64,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, event_type: &EventType, consumer: &ConsumerLabel) -> bool {
        self.entries
            .contains_key(&(event_type.clone(), consumer.clone()))
    }

    /// Handlers for `event_type`, oldest registration first.
    fn handlers_for(&self, event_type: &EventType) -> Vec<EventHandler> {
        let mut matching: Vec<&Registration> = self
            .entries
            .iter()
            .filter(|((t, _), _)| t == event_type)
            .map(|(_, r)| r)
            .collect();
        matching.sort_by_key(|r| r.generation);
        matching.into_iter().map(|r| Arc::clone(&r.handler)).collect()
    }

    fn has_consumers(&self, event_type: &EventType) -> bool {
        self.entries.keys().any(|(t, _)| t == event_type)
    }
}

pub struct SubscriptionRegistry {
    channel: Arc<dyn PushChannel>,
    filter: Arc<InboundFilter>,
    table: Arc<Mutex<RegistrationTable>>,
}

impl SubscriptionRegistry {
    pub fn new(
        channel: Arc<dyn PushChannel>,
        filter: Arc<InboundFilter>,
        table: RegistrationTable,
    ) -> Self {
        Self {
            channel,
            filter,
            table: Arc::new(Mutex::new(table)),
        }
    }

    /// Attach `handler` for `(event_type, consumer)`, replacing any handler
    /// already registered under that pair.
    pub fn register(
        &self,
        event_type: EventType,
        consumer: ConsumerLabel,
        handler: EventHandler,
    ) -> SubscriptionToken {
        let mut table = self.lock();
        let key = (event_type.clone(), consumer.clone());

        if let Some(previous) = table.entries.remove(&key) {
            debug!(
                event_type = %event_type,
                consumer = %consumer,
                generation = previous.generation,
                "Superseding existing subscription"
            );
        }

        table.next_generation += 1;
        let generation = table.next_generation;
        table.entries.insert(
            key,
            Registration {
                generation,
                handler,
            },
        );

        if !table.routes.contains_key(&event_type) {
            let channel_id = self.channel.subscribe(&event_type, self.route(event_type.clone()));
            table.routes.insert(event_type.clone(), channel_id);
        }

        SubscriptionToken {
            event_type,
            consumer,
            generation,
        }
    }

    /// Detach the registration `token` was issued for.
    ///
    /// Returns `false` if it is already gone or has been superseded.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut table = self.lock();
        let key = (token.event_type.clone(), token.consumer.clone());

        match table.entries.get(&key) {
            Some(current) if current.generation == token.generation => {
                table.entries.remove(&key);
                if !table.has_consumers(&token.event_type) {
                    if let Some(channel_id) = table.routes.remove(&token.event_type) {
                        self.channel.unsubscribe(channel_id);
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Whether the registration `token` was issued for is still attached.
    pub fn is_live(&self, token: &SubscriptionToken) -> bool {
        let table = self.lock();
        table
            .entries
            .get(&(token.event_type.clone(), token.consumer.clone()))
            .is_some_and(|r| r.generation == token.generation)
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Detach everything. Returns the number of registrations removed.
    pub fn unsubscribe_all(&self) -> usize {
        let mut table = self.lock();
        let removed = table.entries.len();
        table.entries.clear();
        for (_, channel_id) in table.routes.drain() {
            self.channel.unsubscribe(channel_id);
        }
        removed
    }

    /// Channel handler for one event type. The table lock is released
    /// before any consumer runs, so consumers may register or unsubscribe.
    fn route(&self, event_type: EventType) -> RawHandler {
        let filter = Arc::clone(&self.filter);
        let table = Arc::clone(&self.table);
        Arc::new(move |raw| {
            let handlers = lock(&table).handlers_for(&event_type);
            if handlers.is_empty() {
                return;
            }
            let Some(event) = filter.admit(&event_type, raw) else {
                return;
            };
            for handler in &handlers {
                handler(&event);
                filter.stats().record_delivered();
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistrationTable> {
        lock(&self.table)
    }
}

fn lock(table: &Mutex<RegistrationTable>) -> MutexGuard<'_, RegistrationTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalPushChannel;
    use crate::stats::SyncStats;
    use crate::validator::EventValidator;
    use mise_core::TenantId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<LocalPushChannel>, SubscriptionRegistry) {
        let channel = Arc::new(LocalPushChannel::new());
        let filter = Arc::new(InboundFilter::new(
            EventValidator::new(),
            TenantId::new("R1"),
            Arc::new(SyncStats::default()),
        ));
        let registry = SubscriptionRegistry::new(
            channel.clone() as Arc<dyn PushChannel>,
            filter,
            RegistrationTable::new(),
        );
        (channel, registry)
    }

    fn counter_handler(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_reregistration_replaces_handler() {
        let (channel, registry) = setup();
        let event_type = EventType::new("payment:refunded");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.register(
            event_type.clone(),
            ConsumerLabel::new("PaymentSync"),
            counter_handler(&first),
        );
        registry.register(
            event_type.clone(),
            ConsumerLabel::new("PaymentSync"),
            counter_handler(&second),
        );

        assert_eq!(channel.subscription_count(&event_type), 1);
        channel.emit(&event_type, &json!({"tenantId": "R1"}));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_consumers_coexist() {
        let (channel, registry) = setup();
        let event_type = EventType::new("order:created");
        let counter = Arc::new(AtomicUsize::new(0));

        registry.register(event_type.clone(), ConsumerLabel::new("OrderBoard"), counter_handler(&counter));
        registry.register(event_type.clone(), ConsumerLabel::new("KitchenQueue"), counter_handler(&counter));

        channel.emit(&event_type, &json!({"tenantId": "R1"}));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(registry.live_count(), 2);
        assert_eq!(channel.subscription_count(&event_type), 1);
    }

    #[test]
    fn test_one_push_message_is_validated_once() {
        let (channel, registry) = setup();
        let event_type = EventType::new("order:created");
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(event_type.clone(), ConsumerLabel::new("OrderBoard"), counter_handler(&counter));
        registry.register(event_type.clone(), ConsumerLabel::new("KitchenQueue"), counter_handler(&counter));

        channel.emit(&event_type, &json!({"entityId": "O1"}));
        channel.emit(&event_type, &json!({"tenantId": "R1"}));

        let stats = registry.filter.stats().snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_route_stays_until_last_consumer_leaves() {
        let (channel, registry) = setup();
        let event_type = EventType::new("order:created");
        let counter = Arc::new(AtomicUsize::new(0));
        let board = registry.register(event_type.clone(), ConsumerLabel::new("OrderBoard"), counter_handler(&counter));
        let queue = registry.register(event_type.clone(), ConsumerLabel::new("KitchenQueue"), counter_handler(&counter));

        assert!(registry.unsubscribe(&board));
        assert_eq!(channel.subscription_count(&event_type), 1);
        channel.emit(&event_type, &json!({"tenantId": "R1"}));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(registry.unsubscribe(&queue));
        assert_eq!(channel.subscription_count(&event_type), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let (channel, registry) = setup();
        let registry = Arc::new(registry);
        let event_type = EventType::new("order:created");
        let slot: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));

        let handler: EventHandler = {
            let registry = Arc::clone(&registry);
            let slot = Arc::clone(&slot);
            Arc::new(move |_| {
                if let Some(token) = slot.lock().expect("slot").take() {
                    registry.unsubscribe(&token);
                }
            })
        };
        let token = registry.register(event_type.clone(), ConsumerLabel::new("OrderBoard"), handler);
        *slot.lock().expect("slot") = Some(token);

        channel.emit(&event_type, &json!({"tenantId": "R1"}));
        assert_eq!(registry.live_count(), 0);
        assert_eq!(channel.subscription_count(&event_type), 0);
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let (channel, registry) = setup();
        let event_type = EventType::new("order:created");
        let counter = Arc::new(AtomicUsize::new(0));
        let token = registry.register(event_type.clone(), ConsumerLabel::new("OrderBoard"), counter_handler(&counter));

        assert!(registry.unsubscribe(&token));
        assert!(!registry.unsubscribe(&token));
        assert!(!registry.is_live(&token));
        assert_eq!(channel.subscription_count(&event_type), 0);
    }

    #[test]
    fn test_stale_token_does_not_remove_newer_registration() {
        let (channel, registry) = setup();
        let event_type = EventType::new("payment:refunded");
        let counter = Arc::new(AtomicUsize::new(0));

        let stale = registry.register(event_type.clone(), ConsumerLabel::new("PaymentSync"), counter_handler(&counter));
        let current = registry.register(event_type.clone(), ConsumerLabel::new("PaymentSync"), counter_handler(&counter));

        assert!(!registry.unsubscribe(&stale));
        assert!(registry.is_live(&current));
        assert_eq!(registry.live_count(), 1);
        assert_eq!(channel.subscription_count(&event_type), 1);
    }

    #[test]
    fn test_handler_sees_only_admitted_events() {
        let (channel, registry) = setup();
        let event_type = EventType::new("order:created");
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(event_type.clone(), ConsumerLabel::new("OrderBoard"), counter_handler(&counter));

        channel.emit(&event_type, &json!({"entityId": "O1"}));
        channel.emit(&event_type, &json!({"tenantId": "R2"}));
        channel.emit(&event_type, &json!({"tenantId": "R1"}));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_all() {
        let (channel, registry) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register(EventType::new("a"), ConsumerLabel::new("x"), counter_handler(&counter));
        registry.register(EventType::new("b"), ConsumerLabel::new("x"), counter_handler(&counter));

        assert_eq!(registry.unsubscribe_all(), 2);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(channel.total_subscriptions(), 0);
    }

    #[test]
    fn test_tables_are_independent() {
        let (_, first) = setup();
        let (_, second) = setup();
        let counter = Arc::new(AtomicUsize::new(0));

        first.register(EventType::new("a"), ConsumerLabel::new("x"), counter_handler(&counter));
        assert_eq!(first.live_count(), 1);
        assert_eq!(second.live_count(), 0);
    }
}
