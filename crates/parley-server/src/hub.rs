//! The connection hub.
//!
//! A single control loop owns the registry of live connections and is the
//! only code that inserts into or removes from it. Everything else talks to
//! the loop through a [`HubHandle`]. Registrations, unregistrations, routed
//! events and barriers share one FIFO queue, so requests from the same
//! producer are handled in the order they were made.
//!
//! Delivery never blocks the loop. Each connection has a bounded outbound
//! queue; if a push finds it full (or its consumer gone) the connection is
//! evicted on the spot, exactly as if it had unregistered. Events read from
//! a connection that is no longer registered are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use parley_core::{
    ChatEvent, ChatStore, ConnectionId, EventKind, Identity, MessageId, PersistenceError,
    PresenceState, UserId,
};
use parley_telemetry::{names, MetricsRecorder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Connection;
use crate::config::ServerConfig;
use crate::presence::PresenceWriter;

/// Receiving half of a connection's outbound queue.
pub type OutboundQueue = mpsc::Receiver<Arc<ChatEvent>>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,
}

/// The hub's view of one live connection.
///
/// Holds the only sender for the connection's outbound queue, so dropping
/// the handle closes the queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: ConnectionId,
    pub identity: Identity,
    outbound: mpsc::Sender<Arc<ChatEvent>>,
}

impl ConnectionHandle {
    pub fn open(connection: &Connection, capacity: usize) -> (Self, OutboundQueue) {
        let (outbound, queue) = mpsc::channel(capacity);
        let handle = Self {
            conn_id: connection.conn_id.clone(),
            identity: connection.identity.clone(),
            outbound,
        };
        (handle, queue)
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    fn push(&self, event: &Arc<ChatEvent>) -> Result<(), Stall> {
        match self.outbound.try_send(Arc::clone(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(self.stall(StallReason::QueueFull)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.stall(StallReason::QueueClosed)),
        }
    }

    fn stall(&self, reason: StallReason) -> Stall {
        Stall {
            user_id: self.user_id().clone(),
            conn_id: self.conn_id.clone(),
            reason,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StallReason {
    QueueFull,
    QueueClosed,
}

/// A connection whose queue rejected a push.
struct Stall {
    user_id: UserId,
    conn_id: ConnectionId,
    reason: StallReason,
}

/// Live connections keyed by user. Mutated only by the hub loop.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<UserId, ConnectionHandle>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.entries.contains_key(user)
    }

    /// Registered users, sorted.
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.entries.keys().cloned().collect();
        users.sort();
        users
    }

    fn get(&self, user: &UserId) -> Option<&ConnectionHandle> {
        self.entries.get(user)
    }

    fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.entries.values()
    }

    fn insert(&mut self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.entries.insert(handle.user_id().clone(), handle)
    }

    /// Remove `user` only while `conn_id` is still its current connection.
    fn remove_if(&mut self, user: &UserId, conn_id: &ConnectionId) -> Option<ConnectionHandle> {
        match self.entries.get(user) {
            Some(current) if &current.conn_id == conn_id => self.entries.remove(user),
            _ => None,
        }
    }

    fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.entries.drain().map(|(_, handle)| handle).collect()
    }
}

enum Request {
    Register(ConnectionHandle),
    Unregister(Departure),
    Route(ChatEvent),
    /// An event read from `conn_id`, routed only while it is still current.
    Inbound {
        conn_id: ConnectionId,
        event: ChatEvent,
    },
    Barrier(oneshot::Sender<()>),
}

struct Departure {
    user_id: UserId,
    conn_id: ConnectionId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DisconnectReason {
    Unregistered,
    Evicted(StallReason),
    Shutdown,
}

impl DisconnectReason {
    fn label(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Evicted(StallReason::QueueFull) => "evicted",
            Self::Evicted(StallReason::QueueClosed) => "gone",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Knobs the hub reads from [`ServerConfig`].
#[derive(Clone, Debug)]
pub struct HubSettings {
    pub route_queue_capacity: usize,
    pub deliver_unsaved_messages: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for HubSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            route_queue_capacity: config.route_queue_capacity,
            deliver_unsaved_messages: config.deliver_unsaved_messages,
        }
    }
}

/// Cloneable entry point to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    requests: mpsc::Sender<Request>,
    registry: Arc<RwLock<Registry>>,
    presence: PresenceWriter,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl HubHandle {
    async fn send(&self, request: Request) -> Result<(), HubError> {
        self.requests.send(request).await.map_err(|_| HubError::Closed)
    }

    /// Queue a connection for registration.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.send(Request::Register(handle)).await
    }

    /// Queue removal of `conn_id`. A no-op once that connection is gone or
    /// has been replaced by a newer one for the same user.
    pub async fn unregister(&self, user_id: &UserId, conn_id: &ConnectionId) -> Result<(), HubError> {
        self.send(Request::Unregister(Departure {
            user_id: user_id.clone(),
            conn_id: conn_id.clone(),
        }))
        .await
    }

    /// Queue an event for routing.
    pub async fn route(&self, event: ChatEvent) -> Result<(), HubError> {
        self.send(Request::Route(event)).await
    }

    /// Queue an event read from `connection`. Dropped by the hub if the
    /// connection has been evicted or replaced by the time it is handled.
    pub async fn submit(&self, connection: &Connection, event: ChatEvent) -> Result<(), HubError> {
        self.send(Request::Inbound {
            conn_id: connection.conn_id.clone(),
            event,
        })
        .await
    }

    /// Point-in-time snapshot of connected users.
    pub fn list_online(&self) -> Vec<UserId> {
        self.registry.read().users()
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.registry.read().contains(user)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Resolves once every request queued before this call has been handled.
    pub async fn barrier(&self) -> Result<(), HubError> {
        let (done, wait) = oneshot::channel();
        self.send(Request::Barrier(done)).await?;
        wait.await.map_err(|_| HubError::Closed)
    }

    /// Wait for queued presence and typing writes.
    pub async fn flush_presence(&self) {
        self.presence.flush().await;
    }

    pub fn metrics(&self) -> Option<&MetricsRecorder> {
        self.metrics.as_deref()
    }
}

/// The control loop state. Build with [`Hub::spawn`].
pub struct Hub {
    registry: Arc<RwLock<Registry>>,
    requests: mpsc::Receiver<Request>,
    store: Arc<dyn ChatStore>,
    presence: PresenceWriter,
    metrics: Option<Arc<MetricsRecorder>>,
    settings: HubSettings,
}

impl Hub {
    /// Start the control loop and its presence writer. The loop stops when
    /// `cancel` fires or every handle has been dropped.
    pub fn spawn(
        store: Arc<dyn ChatStore>,
        settings: HubSettings,
        metrics: Option<Arc<MetricsRecorder>>,
        cancel: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(settings.route_queue_capacity);
        let registry = Arc::new(RwLock::new(Registry::default()));
        let (presence, _writer) = PresenceWriter::spawn(Arc::clone(&store), metrics.clone());

        let handle = HubHandle {
            requests: request_tx,
            registry: Arc::clone(&registry),
            presence: presence.clone(),
            metrics: metrics.clone(),
        };
        let hub = Self {
            registry,
            requests: request_rx,
            store,
            presence,
            metrics,
            settings,
        };
        (handle, tokio::spawn(hub.run(cancel)))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!("hub started");
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = self.requests.recv() => request,
            };
            match request {
                Some(Request::Register(handle)) => self.register(handle).await,
                Some(Request::Unregister(departure)) => self.unregister(departure).await,
                Some(Request::Route(event)) => self.route(event).await,
                Some(Request::Inbound { conn_id, event }) => {
                    self.route_inbound(conn_id, event).await
                }
                Some(Request::Barrier(done)) => {
                    let _ = done.send(());
                }
                None => break,
            }
        }
        self.close_all().await;
        info!("hub stopped");
    }

    async fn register(&mut self, handle: ConnectionHandle) {
        let identity = handle.identity.clone();
        let conn_id = handle.conn_id.clone();
        let replaced = self.registry.write().insert(handle);

        if let Some(old) = replaced {
            // Newest connection wins; the old one is not announced offline.
            info!(
                user_id = %identity.user_id,
                conn_id = %conn_id,
                replaced_conn_id = %old.conn_id,
                "replacing existing connection"
            );
            self.count(names::DISCONNECTS_TOTAL, &[("reason", "replaced")]);
        } else {
            info!(user_id = %identity.user_id, conn_id = %conn_id, "connection registered");
        }
        self.count(names::CONNECTIONS_TOTAL, &[]);
        self.record_active();

        self.presence.set_online(&identity.user_id, true);
        self.route(ChatEvent::status(&identity, PresenceState::Online)).await;
    }

    async fn unregister(&mut self, departure: Departure) {
        let removed = self
            .registry
            .write()
            .remove_if(&departure.user_id, &departure.conn_id);
        match removed {
            Some(handle) => {
                let status = self.retire(handle, DisconnectReason::Unregistered);
                self.route(status).await;
            }
            None => debug!(
                user_id = %departure.user_id,
                conn_id = %departure.conn_id,
                "unregister ignored, connection already gone"
            ),
        }
    }

    async fn route_inbound(&mut self, conn_id: ConnectionId, event: ChatEvent) {
        let current = self
            .registry
            .read()
            .get(&event.user_id)
            .is_some_and(|handle| handle.conn_id == conn_id);
        if !current {
            debug!(
                user_id = %event.user_id,
                conn_id = %conn_id,
                kind = %event.kind,
                "event from a retired connection dropped"
            );
            self.count(names::STALE_EVENTS_DROPPED, &[]);
            return;
        }
        self.route(event).await;
    }

    /// Route `event` plus any offline notices caused by evictions along the way.
    async fn route(&mut self, event: ChatEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            for (handle, reason) in self.dispatch(event).await {
                pending.push_back(self.retire(handle, DisconnectReason::Evicted(reason)));
            }
        }
    }

    async fn dispatch(&mut self, mut event: ChatEvent) -> Vec<(ConnectionHandle, StallReason)> {
        self.count(names::EVENTS_ROUTED, &[("kind", event.kind.as_str())]);
        match event.kind {
            EventKind::Message => {
                if event.id.is_none() {
                    match self.persist(&event).await {
                        Ok(id) => event.id = Some(id),
                        Err(e) => {
                            warn!(user_id = %event.user_id, error = %e, "failed to persist message");
                            self.count(names::PERSIST_FAILURES, &[]);
                            if !self.settings.deliver_unsaved_messages {
                                return Vec::new();
                            }
                        }
                    }
                }
                self.deliver(event)
            }
            EventKind::Typing => {
                let Some(receiver) = event.receiver_id.clone() else {
                    debug!(user_id = %event.user_id, "typing event without receiver dropped");
                    return Vec::new();
                };
                let (user, is_typing) = (event.user_id.clone(), event.is_typing);
                let evicted = self.deliver(event);
                self.presence.set_typing(&user, &receiver, is_typing);
                evicted
            }
            EventKind::Status => self.deliver(event),
        }
    }

    async fn persist(&self, event: &ChatEvent) -> Result<MessageId, PersistenceError> {
        let content = event.content.as_deref().unwrap_or_default();
        self.store
            .save_message(&event.user_id, event.receiver_id.as_ref(), content, event.timestamp)
            .await
    }

    /// Push to the receiver, or to everyone when there is none. Connections
    /// whose queue rejects the push are removed and returned.
    fn deliver(&mut self, event: ChatEvent) -> Vec<(ConnectionHandle, StallReason)> {
        let event = Arc::new(event);
        let stalls: Vec<Stall> = {
            let registry = self.registry.read();
            match &event.receiver_id {
                Some(receiver) => match registry.get(receiver) {
                    Some(handle) => handle.push(&event).err().into_iter().collect(),
                    None => {
                        debug!(
                            user_id = %event.user_id,
                            receiver_id = %receiver,
                            kind = %event.kind,
                            "receiver offline, event dropped"
                        );
                        Vec::new()
                    }
                },
                None => {
                    let stalls: Vec<Stall> =
                        registry.iter().filter_map(|h| h.push(&event).err()).collect();
                    let recipients = registry.len() - stalls.len();
                    debug!(kind = %event.kind, recipients, "broadcast delivered");
                    self.observe(names::FANOUT_RECIPIENTS, recipients as f64);
                    stalls
                }
            }
        };

        if stalls.is_empty() {
            return Vec::new();
        }
        let mut registry = self.registry.write();
        let evicted = stalls
            .into_iter()
            .filter_map(|stall| {
                let handle = registry.remove_if(&stall.user_id, &stall.conn_id)?;
                warn!(
                    user_id = %stall.user_id,
                    conn_id = %stall.conn_id,
                    reason = ?stall.reason,
                    "outbound queue rejected event, disconnecting"
                );
                Some((handle, stall.reason))
            })
            .collect();
        evicted
    }

    /// Finish off a connection already removed from the registry: close its
    /// queue, revoke presence and build the offline notice.
    fn retire(&mut self, handle: ConnectionHandle, reason: DisconnectReason) -> ChatEvent {
        let ConnectionHandle {
            conn_id,
            identity,
            outbound,
        } = handle;
        drop(outbound);

        info!(
            user_id = %identity.user_id,
            conn_id = %conn_id,
            reason = reason.label(),
            "connection removed"
        );
        if let DisconnectReason::Evicted(StallReason::QueueFull) = reason {
            self.count(names::BACKPRESSURE_EVICTIONS, &[]);
        }
        self.count(names::DISCONNECTS_TOTAL, &[("reason", reason.label())]);
        self.record_active();

        self.presence.set_online(&identity.user_id, false);
        ChatEvent::status(&identity, PresenceState::Offline)
    }

    async fn close_all(&mut self) {
        let remaining = self.registry.write().drain();
        for handle in remaining {
            let _ = self.retire(handle, DisconnectReason::Shutdown);
        }
        self.presence.flush().await;
    }

    fn count(&self, name: &str, labels: &[(&str, &str)]) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, labels, 1);
        }
    }

    fn observe(&self, name: &str, value: f64) {
        if let Some(m) = &self.metrics {
            m.histogram_observe(name, &[], value);
        }
    }

    fn record_active(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set(names::CONNECTIONS_ACTIVE, &[], self.registry.read().len() as f64);
        }
    }
}
