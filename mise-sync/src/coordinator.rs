//! Cache sync coordinator.
//!
//! Owns the whole pipeline for one tenant:
//!
//! ```text
//! push channel -> inbound filter -> handlers
//!                                 \-> cache-sync handler -> event loop
//!                                        -> optimistic patch
//!                                        -> coalescer -> dispatcher -> cache store
//! ```
//!
//! ## Event loop
//!
//! A single tokio task owns the coalescer and the dispatcher. Each turn
//! handles exactly one of: a command (event, manual invalidation, resync,
//! shutdown), a connection state change, or the earliest batch deadline.
//! Turns run to completion, so batch state is never shared. Every turn ends
//! by flushing the batches that are already due.

use crate::bindings::{DomainBindings, OptimisticPatch};
use crate::channel::{ConnectionState, PushChannel};
use crate::coalescer::InvalidationCoalescer;
use crate::dispatcher::CacheInvalidationDispatcher;
use crate::filter::InboundFilter;
use crate::registry::{RegistrationTable, SubscriptionRegistry, SubscriptionToken};
use crate::stats::{SyncStats, SyncStatsSnapshot};
use crate::validator::EventValidator;
use mise_cache::{CacheStore, KeyPattern};
use mise_core::{
    ConsumerLabel, DomainName, Event, EventType, MiseResult, SyncConfig, SyncError, TenantId,
    MAX_WINDOW_MS,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumer label of the coordinator's own handlers. Reserved: fragments
/// cannot register under it.
pub const CACHE_SYNC_CONSUMER: &str = "cache-sync";

#[derive(Debug)]
enum SyncCommand {
    Event(Event),
    Invalidate {
        domain: DomainName,
        patterns: BTreeSet<KeyPattern>,
        window: Duration,
    },
    Resync {
        ack: oneshot::Sender<usize>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

pub struct SyncCoordinator {
    id: Uuid,
    tenant_id: TenantId,
    bindings: Arc<DomainBindings>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<SyncStats>,
    commands: mpsc::UnboundedSender<SyncCommand>,
    task: Option<JoinHandle<()>>,
}

impl SyncCoordinator {
    /// Build the pipeline and start the event loop on the current runtime.
    pub fn spawn(
        config: &SyncConfig,
        channel: Arc<dyn PushChannel>,
        store: Arc<dyn CacheStore>,
    ) -> MiseResult<Self> {
        Self::spawn_with_table(config, channel, store, RegistrationTable::new())
    }

    /// Like [`SyncCoordinator::spawn`], with a caller-provided registration
    /// table.
    pub fn spawn_with_table(
        config: &SyncConfig,
        channel: Arc<dyn PushChannel>,
        store: Arc<dyn CacheStore>,
        table: RegistrationTable,
    ) -> MiseResult<Self> {
        let bindings = Arc::new(DomainBindings::compile(config)?);
        let runtime = Handle::try_current().map_err(|e| SyncError::LoopFailed {
            reason: e.to_string(),
        })?;

        let id = Uuid::now_v7();
        let tenant_id = config.tenant_id.clone();
        let stats = Arc::new(SyncStats::default());
        let filter = Arc::new(InboundFilter::new(
            EventValidator::from_config(config),
            tenant_id.clone(),
            Arc::clone(&stats),
        ));
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&channel),
            filter,
            table,
        ));

        let (commands, rx) = mpsc::unbounded_channel();
        let sync_loop = SyncLoop::new(
            id,
            config,
            Arc::clone(&bindings),
            store,
            Arc::clone(&stats),
            channel.as_ref(),
        );
        let task = runtime.spawn(sync_loop.run(rx));

        let coordinator = Self {
            id,
            tenant_id,
            bindings,
            registry,
            stats,
            commands,
            task: Some(task),
        };
        let event_types = coordinator.attach_cache_handlers();

        info!(
            coordinator_id = %id,
            tenant_id = %coordinator.tenant_id,
            domains = coordinator.bindings.domains().len(),
            event_types,
            "Cache sync coordinator started"
        );
        Ok(coordinator)
    }

    /// One canonical handler per bound event type, forwarding to the loop.
    fn attach_cache_handlers(&self) -> usize {
        let consumer = ConsumerLabel::new(CACHE_SYNC_CONSUMER);
        let mut attached = 0;
        for event_type in self.bindings.event_types() {
            let commands = self.commands.clone();
            self.registry.register(
                event_type.clone(),
                consumer.clone(),
                Arc::new(move |event: &Event| {
                    if commands.send(SyncCommand::Event(event.clone())).is_err() {
                        debug!(
                            event_type = %event.event_type,
                            "Sync loop stopped; dropping event"
                        );
                    }
                }),
            );
            attached += 1;
        }
        attached
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Subscribe a consumer. Replaces any handler it already has for
    /// `event_type`.
    ///
    /// Fails with [`SyncError::ReservedConsumer`] for
    /// [`CACHE_SYNC_CONSUMER`], which would replace the coordinator's own
    /// invalidation handler.
    pub fn register<F>(
        &self,
        event_type: EventType,
        consumer: ConsumerLabel,
        handler: F,
    ) -> MiseResult<SubscriptionToken>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if consumer.as_str() == CACHE_SYNC_CONSUMER {
            return Err(SyncError::ReservedConsumer { consumer }.into());
        }
        Ok(self.registry.register(event_type, consumer, Arc::new(handler)))
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.registry.unsubscribe(token)
    }

    pub fn is_live(&self, token: &SubscriptionToken) -> bool {
        self.registry.is_live(token)
    }

    /// Live registrations, the coordinator's own included.
    pub fn live_subscriptions(&self) -> usize {
        self.registry.live_count()
    }

    /// Queue a coalesced invalidation for `domain`. An empty pattern set is
    /// accepted and ignored.
    pub fn request_invalidation(
        &self,
        domain: &DomainName,
        patterns: BTreeSet<KeyPattern>,
        window: Duration,
    ) -> MiseResult<()> {
        if self.bindings.domain(domain).is_none() {
            return Err(SyncError::UnknownDomain {
                domain: domain.clone(),
            }
            .into());
        }
        if window > Duration::from_millis(MAX_WINDOW_MS) {
            return Err(SyncError::WindowTooLong {
                window_ms: window.as_millis(),
                max_ms: MAX_WINDOW_MS,
            }
            .into());
        }
        if let Some(foreign) = patterns.iter().find(|p| p.tenant_id() != &self.tenant_id) {
            return Err(SyncError::TenantMismatch {
                current: self.tenant_id.clone(),
                requested: foreign.tenant_id().clone(),
            }
            .into());
        }
        if patterns.is_empty() {
            debug!(domain = %domain, "Ignoring invalidation request without patterns");
            return Ok(());
        }

        self.commands
            .send(SyncCommand::Invalidate {
                domain: domain.clone(),
                patterns,
                window,
            })
            .map_err(|_| SyncError::LoopStopped)?;
        Ok(())
    }

    /// Invalidate every domain's tenant-wide patterns now.
    ///
    /// Returns the number of domains flushed.
    pub async fn resync(&self) -> MiseResult<usize> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(SyncCommand::Resync { ack })
            .map_err(|_| SyncError::LoopStopped)?;
        let flushed = done.await.map_err(|_| SyncError::LoopStopped)?;
        Ok(flushed)
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Detach every handler, flush pending batches immediately and stop
    /// the loop.
    pub async fn shutdown(mut self) -> MiseResult<SyncStatsSnapshot> {
        let detached = self.registry.unsubscribe_all();

        let (ack, done) = oneshot::channel();
        self.commands
            .send(SyncCommand::Shutdown { ack })
            .map_err(|_| SyncError::LoopStopped)?;
        done.await.map_err(|_| SyncError::LoopStopped)?;

        if let Some(task) = self.task.take() {
            task.await.map_err(|e| SyncError::LoopFailed {
                reason: e.to_string(),
            })?;
        }

        info!(
            coordinator_id = %self.id,
            detached,
            "Cache sync coordinator stopped"
        );
        Ok(self.stats.snapshot())
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        // Pending batches still flush on schedule once the handlers are gone.
        self.registry.unsubscribe_all();
    }
}

struct SyncLoop {
    id: Uuid,
    tenant_id: TenantId,
    bindings: Arc<DomainBindings>,
    coalescer: InvalidationCoalescer,
    dispatcher: CacheInvalidationDispatcher,
    stats: Arc<SyncStats>,
    connection: watch::Receiver<ConnectionState>,
    last_state: ConnectionState,
    resync_on_reconnect: bool,
}

impl SyncLoop {
    fn new(
        id: Uuid,
        config: &SyncConfig,
        bindings: Arc<DomainBindings>,
        store: Arc<dyn CacheStore>,
        stats: Arc<SyncStats>,
        channel: &dyn PushChannel,
    ) -> Self {
        Self {
            id,
            tenant_id: config.tenant_id.clone(),
            bindings,
            coalescer: InvalidationCoalescer::new(),
            dispatcher: CacheInvalidationDispatcher::new(store, Arc::clone(&stats)),
            stats,
            connection: channel.watch_connection(),
            last_state: channel.connection_state(),
            resync_on_reconnect: config.resync_on_reconnect,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SyncCommand>) {
        let mut commands_open = true;
        let mut connection_open = true;

        loop {
            if !commands_open && self.coalescer.is_idle() {
                break;
            }
            let deadline = self.coalescer.next_deadline();

            tokio::select! {
                biased;

                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if self.turn(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        commands_open = false;
                        debug!(
                            coordinator_id = %self.id,
                            pending = self.coalescer.pending_len(),
                            "Command channel closed"
                        );
                    }
                },

                changed = self.connection.changed(), if connection_open => match changed {
                    Ok(()) => {
                        let state = *self.connection.borrow_and_update();
                        self.on_connection_state(state);
                        self.flush_due(Instant::now());
                    }
                    Err(_) => connection_open = false,
                },

                _ = wait_until(deadline) => self.flush_due(Instant::now()),
            }
        }

        debug!(coordinator_id = %self.id, "Sync loop stopped");
    }

    /// Handle one command, then flush whatever fell due while it waited.
    fn turn(&mut self, command: SyncCommand) -> ControlFlow<()> {
        let flow = self.handle(command);
        if flow.is_continue() {
            self.flush_due(Instant::now());
        }
        flow
    }

    fn handle(&mut self, command: SyncCommand) -> ControlFlow<()> {
        match command {
            SyncCommand::Event(event) => self.on_event(&event),
            SyncCommand::Invalidate {
                domain,
                patterns,
                window,
            } => {
                let max_wait = self.bindings.domain(&domain).and_then(|d| d.max_wait);
                self.request(&domain, patterns, window, max_wait);
            }
            SyncCommand::Resync { ack } => {
                let flushed = self.resync();
                let _ = ack.send(flushed);
            }
            SyncCommand::Shutdown { ack } => {
                self.flush_all();
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_event(&mut self, event: &Event) {
        let bindings = Arc::clone(&self.bindings);
        for binding in bindings.for_event(&event.event_type) {
            if let Some(patch) = binding.optimistic() {
                self.apply_optimistic(patch, event);
            }
            let patterns = binding.patterns_for(&self.tenant_id, event);
            self.request(
                binding.domain(),
                patterns,
                binding.window(),
                binding.max_wait(),
            );
        }
    }

    fn request(
        &mut self,
        domain: &DomainName,
        patterns: BTreeSet<KeyPattern>,
        window: Duration,
        max_wait: Option<Duration>,
    ) {
        if patterns.is_empty() {
            return;
        }
        self.stats.record_invalidation_request();
        let count = patterns.len();
        let deadline =
            self.coalescer
                .request_invalidation(domain, patterns, window, max_wait, Instant::now());
        debug!(
            domain = %domain,
            patterns = count,
            flush_in_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Invalidation requested"
        );
    }

    fn apply_optimistic(&self, patch: &OptimisticPatch, event: &Event) {
        let Some(key) = patch.key_for(&self.tenant_id, event) else {
            debug!(
                event_type = %event.event_type,
                "Skipping optimistic update for event without entity id"
            );
            return;
        };

        let updater = |cached: &Value| patch.apply(cached, event);
        match self.dispatcher.store().mutate(&key, &updater) {
            Ok(true) => {
                self.stats.record_optimistic_update();
                debug!(key = %key, "Applied optimistic update");
            }
            Ok(false) => debug!(key = %key, "No cached entry to update optimistically"),
            Err(err) => {
                self.stats.record_store_failure();
                error!(key = %key, error = %err, "Optimistic cache update failed");
            }
        }
    }

    fn flush_due(&mut self, now: Instant) {
        for batch in self.coalescer.take_due(now) {
            self.dispatcher.flush(&batch.domain, &batch.patterns);
        }
    }

    fn flush_all(&mut self) {
        for batch in self.coalescer.drain() {
            self.dispatcher.flush(&batch.domain, &batch.patterns);
        }
    }

    fn resync(&mut self) -> usize {
        let bindings = Arc::clone(&self.bindings);
        let mut flushed = 0;
        for settings in bindings.domains() {
            let batch = self
                .coalescer
                .force(&settings.name, settings.resync_patterns(&self.tenant_id));
            self.dispatcher.flush(&batch.domain, &batch.patterns);
            flushed += 1;
        }
        self.stats.record_resync();
        info!(
            coordinator_id = %self.id,
            domains = flushed,
            "Resynchronized cached domains"
        );
        flushed
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.last_state, state);
        match (previous, state) {
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                info!(coordinator_id = %self.id, "Push channel reconnected");
                if self.resync_on_reconnect {
                    self.resync();
                }
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!(
                    coordinator_id = %self.id,
                    "Push channel disconnected; events are missed until it reconnects"
                );
            }
            _ => {}
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
