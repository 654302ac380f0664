//! Push channel contract and an in-process implementation.
//!
//! The transport itself (connection, reconnect backoff, framing) lives
//! outside this crate. The coordinator only needs to attach and detach
//! named-event handlers and to observe connection state.

use mise_core::EventType;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Handler attached to the channel for one event type.
pub type RawHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one attached handler on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelSubscriptionId(u64);

impl ChannelSubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Persistent push transport delivering named events.
pub trait PushChannel: Send + Sync {
    /// Attach `handler` to every future delivery of `event_type`.
    fn subscribe(&self, event_type: &EventType, handler: RawHandler) -> ChannelSubscriptionId;

    /// Detach a handler. Returns `false` if it was already detached.
    fn unsubscribe(&self, id: ChannelSubscriptionId) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Receiver notified on every connection state change.
    fn watch_connection(&self) -> watch::Receiver<ConnectionState>;
}

/// In-process push channel.
///
/// Handlers for an event type run synchronously, in subscription order, on
/// the thread calling [`LocalPushChannel::emit`]. Connection state is set by
/// whoever owns the underlying transport.
pub struct LocalPushChannel {
    handlers: Mutex<BTreeMap<ChannelSubscriptionId, (EventType, RawHandler)>>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Default for LocalPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPushChannel {
    /// A connected channel with no handlers.
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Connected);
        Self {
            handlers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            state,
        }
    }

    /// Deliver `payload` to every handler of `event_type`.
    ///
    /// Returns the number of handlers invoked. The handler table is not
    /// locked while handlers run, so handlers may subscribe or unsubscribe.
    pub fn emit(&self, event_type: &EventType, payload: &Value) -> usize {
        let targets: Vec<RawHandler> = self
            .lock()
            .values()
            .filter(|(t, _)| t == event_type)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        debug!(
            event_type = %event_type,
            handlers = targets.len(),
            "Delivering push event"
        );
        for handler in &targets {
            handler(payload);
        }
        targets.len()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Push channel state changed");
        }
    }

    /// Live handlers attached for `event_type`.
    pub fn subscription_count(&self, event_type: &EventType) -> usize {
        self.lock().values().filter(|(t, _)| t == event_type).count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.lock().len()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<ChannelSubscriptionId, (EventType, RawHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PushChannel for LocalPushChannel {
    fn subscribe(&self, event_type: &EventType, handler: RawHandler) -> ChannelSubscriptionId {
        let id = ChannelSubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, (event_type.clone(), handler));
        id
    }

    fn unsubscribe(&self, id: ChannelSubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> RawHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_reaches_matching_handlers_only() {
        let channel = LocalPushChannel::new();
        let created = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        channel.subscribe(&EventType::new("payment:created"), counting_handler(&created));
        channel.subscribe(&EventType::new("payment:failed"), counting_handler(&failed));

        let invoked = channel.emit(&EventType::new("payment:created"), &json!({}));
        assert_eq!(invoked, 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_detaches_once() {
        let channel = LocalPushChannel::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = channel.subscribe(&EventType::new("order:created"), counting_handler(&counter));

        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));
        assert_eq!(channel.emit(&EventType::new("order:created"), &json!({})), 0);
        assert_eq!(channel.total_subscriptions(), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_emit() {
        let channel = Arc::new(LocalPushChannel::new());
        let event_type = EventType::new("order:created");
        let slot: Arc<Mutex<Option<ChannelSubscriptionId>>> = Arc::new(Mutex::new(None));

        let handler: RawHandler = {
            let channel = Arc::clone(&channel);
            let slot = Arc::clone(&slot);
            Arc::new(move |_| {
                if let Some(id) = slot.lock().expect("slot").take() {
                    channel.unsubscribe(id);
                }
            })
        };
        let id = channel.subscribe(&event_type, handler);
        *slot.lock().expect("slot") = Some(id);

        assert_eq!(channel.emit(&event_type, &json!({})), 1);
        assert_eq!(channel.subscription_count(&event_type), 0);
    }

    #[test]
    fn test_connection_state_is_observable() {
        let channel = LocalPushChannel::new();
        let mut rx = channel.watch_connection();
        assert_eq!(channel.connection_state(), ConnectionState::Connected);

        channel.set_connection_state(ConnectionState::Disconnected);
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);
        assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    }
}
