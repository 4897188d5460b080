//! Node core.
//!
//! Owns the local subscriber registry and orchestrates policy, history,
//! presence, and the broker. All cross-node traffic, local delivery
//! included, flows through the broker so every node observes the same
//! per-channel order.

use crate::client::{Delivery, LocalClient, ServerEvent, Subscription};
use crate::config::NodeConfig;
use crate::hooks::{
    ConnectDecision, EventHooks, NoopHooks, PublishDecision, SubscribeDecision,
};
use crate::metrics;
use bytes::Bytes;
use dashmap::DashMap;
use relay_core::{
    validate_channel_name, ChannelOptions, PolicyError, PolicyRegistry, PresenceEntry,
};
use relay_engine::{
    Broker, BrokerError, BrokerSink, HistoryStore, MemoryEngine, PresenceStore, RecoveredHistory,
    StoreError,
};
use relay_proto::{ClientInfo, Envelope, NodeId, Publication};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Channel namespace not configured (strict mode).
    #[error("Unknown channel namespace: {0}")]
    UnknownNamespace(String),

    /// Operation disallowed by the channel's options.
    #[error("Channel {channel}: {reason}")]
    PolicyViolation {
        /// Channel the operation targeted.
        channel: String,
        /// Which option forbade it.
        reason: &'static str,
    },

    /// A lifecycle hook rejected the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No such connected client.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Client already holds a subscription to the channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Client holds no subscription to the channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Subscriber delivery queue overflowed.
    #[error("Subscriber delivery queue overflow")]
    CapacityExceeded,

    /// Node no longer accepts new operations.
    #[error("Node is shutting down")]
    ShuttingDown,

    /// Configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Broker failure.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<PolicyError> for NodeError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::UnknownNamespace(ns) => NodeError::UnknownNamespace(ns),
            other => NodeError::InvalidConfig(other.to_string()),
        }
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Recovery result: `None` when not attempted, `Some(false)` when the
    /// subscription is fresh (gap or recovery unavailable), `Some(true)`
    /// when a gap-free backlog was flushed to the event stream.
    pub recovered: Option<bool>,
    /// Sequence position of the subscription after the backlog flush.
    pub position: u64,
}

/// Node statistics.
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Connected clients.
    pub clients: usize,
    /// Channels with local subscribers.
    pub channels: usize,
    /// Total local subscriptions.
    pub subscriptions: usize,
}

type ChannelMember = (Arc<LocalClient>, Arc<Subscription>);

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_client_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn_{:x}", timestamp.wrapping_add(counter))
}

/// Builder for a [`Node`].
///
/// Broker and stores default to one shared [`MemoryEngine`]; pass other
/// implementations to run against a cluster transport or external store.
pub struct NodeBuilder {
    config: NodeConfig,
    broker: Option<Arc<dyn Broker>>,
    history: Option<Arc<dyn HistoryStore>>,
    presence: Option<Arc<dyn PresenceStore>>,
    hooks: Option<Arc<dyn EventHooks>>,
}

impl NodeBuilder {
    /// Start a builder from a configuration.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            broker: None,
            history: None,
            presence: None,
            hooks: None,
        }
    }

    /// Use a specific broker implementation.
    #[must_use]
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use a specific history store implementation.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Use a specific presence store implementation.
    #[must_use]
    pub fn with_presence(mut self, presence: Arc<dyn PresenceStore>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Use one engine for broker, history, and presence at once.
    ///
    /// Sharing the same engine between several nodes forms an in-process
    /// cluster.
    #[must_use]
    pub fn with_engine<E>(self, engine: Arc<E>) -> Self
    where
        E: Broker + HistoryStore + PresenceStore + 'static,
    {
        let broker: Arc<dyn Broker> = engine.clone();
        let history: Arc<dyn HistoryStore> = engine.clone();
        let presence: Arc<dyn PresenceStore> = engine;
        self.with_broker(broker)
            .with_history(history)
            .with_presence(presence)
    }

    /// Install lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn EventHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Build the node, validating the channel configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for invalid namespaces or options that
    /// enable recovery without history retention.
    pub fn build(self) -> Result<Node, NodeError> {
        let policy = self
            .config
            .policy_registry()
            .map_err(|e| NodeError::InvalidConfig(e.to_string()))?;

        let (broker, history, presence) = if let (Some(b), Some(h), Some(p)) =
            (self.broker.clone(), self.history.clone(), self.presence.clone())
        {
            (b, h, p)
        } else {
            let engine = Arc::new(MemoryEngine::new(self.config.liveness()));
            let b: Arc<dyn Broker> = match self.broker {
                Some(b) => b,
                None => engine.clone(),
            };
            let h: Arc<dyn HistoryStore> = match self.history {
                Some(h) => h,
                None => engine.clone(),
            };
            let p: Arc<dyn PresenceStore> = match self.presence {
                Some(p) => p,
                None => engine,
            };
            (b, h, p)
        };

        let hooks = self.hooks.unwrap_or_else(|| Arc::new(NoopHooks));

        Ok(Node {
            inner: Arc::new(NodeInner {
                id: self.config.node_id(),
                policy,
                broker,
                history,
                presence,
                hooks,
                clients: DashMap::new(),
                channels: DashMap::new(),
                queue_capacity: self.config.delivery.queue_capacity,
                buffer_capacity: self.config.delivery.buffer_capacity,
                sweep_interval: self.config.sweep_interval(),
                closed: AtomicBool::new(false),
                inflight: AtomicUsize::new(0),
                drained: Notify::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }
}

/// A member of a pub/sub cluster.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Build a node from a configuration with the default engine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the channel configuration is rejected.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        NodeBuilder::new(config).build()
    }

    /// Start a builder for custom engine or hook wiring.
    #[must_use]
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// The node's cluster identity.
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Get node statistics.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            clients: self.inner.clients.len(),
            channels: self.inner.channels.len(),
            subscriptions: self.inner.channels.iter().map(|m| m.len()).sum(),
        }
    }

    /// Attach to the broker control stream and start background
    /// maintenance. Call once before serving clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses the attachment.
    pub async fn run(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        metrics::init_metrics();

        let sink = Arc::new(NodeSink {
            inner: Arc::downgrade(inner),
        });
        inner.broker.attach(inner.id.clone(), sink).await?;

        let weak = Arc::downgrade(inner);
        let interval = inner.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut delay = interval;
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                match inner.presence.sweep().await {
                    Ok(evicted) => {
                        if evicted > 0 {
                            metrics::record_presence_evicted(evicted);
                        }
                        delay = interval;
                    }
                    Err(e) => {
                        // Maintenance never crashes the node: retry with
                        // capped exponential backoff.
                        delay = (delay * 2).min(interval * 8);
                        warn!(error = %e, retry_in = ?delay, "Presence sweep failed");
                    }
                }
            }
        });
        *inner.lock_sweeper() = Some(handle);

        info!(node = %inner.id, broker = inner.broker.name(), "Node running");
        Ok(())
    }

    /// Register a connected client.
    ///
    /// Returns the client id plus the event stream the connection layer
    /// forwards to its socket.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the connect hook rejects, or
    /// `ShuttingDown`.
    pub async fn connect(
        &self,
        user: impl Into<String>,
        conn_info: Option<Bytes>,
    ) -> Result<(String, mpsc::Receiver<ServerEvent>), NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        let user = user.into();

        let info_override = match inner.hooks.on_connect(&user, conn_info.as_ref()).await {
            ConnectDecision::Accept { info } => info,
            ConnectDecision::Reject { reason } => return Err(NodeError::PermissionDenied(reason)),
        };

        let client_id = generate_client_id();
        let mut info = ClientInfo::new(user, client_id.clone());
        info.conn_info = info_override.or(conn_info);

        let (client, receiver) = LocalClient::new(info, inner.queue_capacity);
        inner.clients.insert(client_id.clone(), client);
        metrics::record_connection();
        debug!(client = %client_id, "Client connected");

        Ok((client_id, receiver))
    }

    /// Subscribe a client to a channel.
    ///
    /// With `since > 0` and recovery enabled, missed publications are
    /// flushed to the event stream before any live traffic. Publications
    /// racing the call are buffered and merged in sequence order, so the
    /// stream never interleaves backlog and live messages out of order.
    ///
    /// # Errors
    ///
    /// Policy, hook, and engine failures; `AlreadySubscribed` for a
    /// duplicate subscription.
    pub async fn subscribe(
        &self,
        client_id: &str,
        channel: &str,
        since: u64,
    ) -> Result<SubscribeOutcome, NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        validate_channel_name(channel).map_err(NodeError::InvalidChannel)?;
        let options = inner.policy.resolve(channel)?;
        let client = inner.get_client(client_id)?;

        let presence_info = match inner.hooks.on_subscribe(&client.info, channel).await {
            SubscribeDecision::Accept { presence_info } => presence_info,
            SubscribeDecision::Reject { reason } => {
                return Err(NodeError::PermissionDenied(reason))
            }
        };

        // Register in buffering state first: anything the broker delivers
        // from here on is parked and merged after the backlog flush.
        let subscription = Arc::new(Subscription::new());
        {
            let mut subs = client.lock_subscriptions();
            if subs.contains_key(channel) {
                return Err(NodeError::AlreadySubscribed(channel.to_string()));
            }
            subs.insert(channel.to_string(), subscription.clone());
        }
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(client.id().to_string(), (client.clone(), subscription.clone()));
        metrics::set_active_channels(inner.channels.len());

        let mut join_sent = false;
        match inner
            .finish_subscribe(&client, channel, &options, since, presence_info, &subscription, &mut join_sent)
            .await
        {
            Ok(outcome) => {
                metrics::record_subscription();
                debug!(
                    client = %client.id(),
                    channel = %channel,
                    recovered = ?outcome.recovered,
                    position = outcome.position,
                    "Subscribed"
                );
                Ok(outcome)
            }
            Err(e) => {
                inner.rollback_subscribe(&client, channel, &options, join_sent).await;
                if matches!(e, NodeError::CapacityExceeded) {
                    inner
                        .clone()
                        .disconnect_client(
                            client.id().to_string(),
                            "delivery queue overflow".to_string(),
                            true,
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Remove a client's subscription.
    ///
    /// # Errors
    ///
    /// Returns `NotSubscribed` when the client holds no such subscription.
    pub async fn unsubscribe(&self, client_id: &str, channel: &str) -> Result<(), NodeError> {
        let inner = &self.inner;
        let _guard = inner.track();
        let client = inner.get_client(client_id)?;
        inner.remove_subscription(&client, channel, true).await
    }

    /// Unsubscribe every connection of a user from a channel, cluster-wide.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the control event is not accepted.
    pub async fn unsubscribe_user(&self, user: &str, channel: &str) -> Result<(), NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        inner.broker.publish_unsubscribe(channel, user).await?;
        Ok(())
    }

    /// Publish into a channel on behalf of a client.
    ///
    /// Checks the channel's publish permission and the publish hook before
    /// any side effect: a rejected publish appends nothing and broadcasts
    /// nothing. Returns the assigned sequence number (0 without history).
    ///
    /// # Errors
    ///
    /// `PolicyViolation`, `PermissionDenied`, or engine failures.
    pub async fn publish_as(
        &self,
        client_id: &str,
        channel: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64, NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        validate_channel_name(channel).map_err(NodeError::InvalidChannel)?;
        let options = inner.policy.resolve(channel)?;
        if !options.publish_allowed {
            return Err(NodeError::PolicyViolation {
                channel: channel.to_string(),
                reason: "publish not allowed",
            });
        }
        let client = inner.get_client(client_id)?;

        let payload = payload.into();
        match inner.hooks.on_publish(&client.info, channel, &payload).await {
            PublishDecision::Accept => {}
            PublishDecision::Reject { reason } => {
                return Err(NodeError::PermissionDenied(reason))
            }
        }

        // Publishing counts as activity for the publisher's presence entry
        if options.presence_enabled && client.subscription(channel).is_some() {
            if let Err(e) = inner.presence.add_or_refresh(channel, client.info.clone()).await {
                warn!(channel = %channel, error = %e, "Presence refresh on publish failed");
            }
        }

        inner.broadcast(channel, payload, &options).await
    }

    /// Publish into a channel from the server side.
    ///
    /// Skips the per-client permission check; the channel's history options
    /// still apply. Returns the assigned sequence number (0 without
    /// history).
    ///
    /// # Errors
    ///
    /// Engine failures, or `ShuttingDown`.
    pub async fn publish(
        &self,
        channel: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64, NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        validate_channel_name(channel).map_err(NodeError::InvalidChannel)?;
        let options = inner.policy.resolve(channel)?;
        inner.broadcast(channel, payload.into(), &options).await
    }

    /// Snapshot the live presence set of a channel.
    ///
    /// # Errors
    ///
    /// `PolicyViolation` when presence is disabled for the channel.
    pub async fn presence(&self, channel: &str) -> Result<Vec<PresenceEntry>, NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        let options = inner.policy.resolve(channel)?;
        if !options.presence_enabled {
            return Err(NodeError::PolicyViolation {
                channel: channel.to_string(),
                reason: "presence disabled",
            });
        }
        Ok(inner.presence.snapshot(channel).await?)
    }

    /// Read a channel's retained history after `since`.
    ///
    /// Channels without history report `recovered == false`.
    ///
    /// # Errors
    ///
    /// Policy or store failures.
    pub async fn history(&self, channel: &str, since: u64) -> Result<RecoveredHistory, NodeError> {
        let inner = &self.inner;
        let _guard = inner.begin()?;
        let options = inner.policy.resolve(channel)?;
        if !options.history_enabled() {
            return Ok(RecoveredHistory::default());
        }
        Ok(inner.history.recover(channel, since, options.retention()).await?)
    }

    /// Disconnect a client, cleaning up its subscriptions and presence.
    ///
    /// # Errors
    ///
    /// Returns `UnknownClient` when no such client is connected.
    pub async fn disconnect(&self, client_id: &str) -> Result<(), NodeError> {
        let disconnected = self
            .inner
            .clone()
            .disconnect_client(client_id.to_string(), "disconnect".to_string(), false)
            .await;
        if disconnected {
            Ok(())
        } else {
            Err(NodeError::UnknownClient(client_id.to_string()))
        }
    }

    /// Shut the node down cooperatively.
    ///
    /// Stops accepting new operations, waits up to `deadline` for in-flight
    /// operations to settle, disconnects remaining clients, then closes the
    /// broker and stores. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; close failures are logged.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), NodeError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(node = %inner.id, "Shutting down");

        let drain = async {
            loop {
                let notified = inner.drained.notified();
                tokio::pin!(notified);
                // Register before the check, or a notification racing the
                // load is lost and the drain stalls to the deadline.
                notified.as_mut().enable();
                if inner.inflight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                inflight = inner.inflight.load(Ordering::Acquire),
                "Shutdown deadline exceeded with operations in flight"
            );
        }

        if let Some(handle) = inner.lock_sweeper().take() {
            handle.abort();
        }

        let client_ids: Vec<String> = inner.clients.iter().map(|c| c.key().clone()).collect();
        for client_id in client_ids {
            inner
                .clone()
                .disconnect_client(client_id, "shutdown".to_string(), false)
                .await;
        }

        if let Err(e) = inner.broker.detach(&inner.id).await {
            warn!(error = %e, "Broker detach failed");
        }
        if let Err(e) = inner.broker.close().await {
            warn!(error = %e, "Broker close failed");
        }
        if let Err(e) = inner.history.close().await {
            warn!(error = %e, "History store close failed");
        }
        if let Err(e) = inner.presence.close().await {
            warn!(error = %e, "Presence store close failed");
        }

        info!(node = %inner.id, "Shutdown complete");
        Ok(())
    }
}

struct NodeInner {
    id: NodeId,
    policy: PolicyRegistry,
    broker: Arc<dyn Broker>,
    history: Arc<dyn HistoryStore>,
    presence: Arc<dyn PresenceStore>,
    hooks: Arc<dyn EventHooks>,
    /// Connected clients by client id.
    clients: DashMap<String, Arc<LocalClient>>,
    /// Local subscriber sets by channel.
    channels: DashMap<String, HashMap<String, ChannelMember>>,
    queue_capacity: usize,
    buffer_capacity: usize,
    sweep_interval: Duration,
    closed: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks one in-flight operation for the shutdown drain.
struct OpGuard<'a> {
    inner: &'a NodeInner,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl NodeInner {
    fn begin(&self) -> Result<OpGuard<'_>, NodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::ShuttingDown);
        }
        Ok(self.track())
    }

    // Cleanup operations stay allowed during shutdown.
    fn track(&self) -> OpGuard<'_> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        OpGuard { inner: self }
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_client(&self, client_id: &str) -> Result<Arc<LocalClient>, NodeError> {
        self.clients
            .get(client_id)
            .map(|c| c.clone())
            .ok_or_else(|| NodeError::UnknownClient(client_id.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_subscribe(
        &self,
        client: &Arc<LocalClient>,
        channel: &str,
        options: &ChannelOptions,
        since: u64,
        presence_info: Option<Bytes>,
        subscription: &Subscription,
        join_sent: &mut bool,
    ) -> Result<SubscribeOutcome, NodeError> {
        let mut recovered = None;
        let mut backlog = Vec::new();
        if since > 0 {
            if options.recovery_enabled {
                let result = self.history.recover(channel, since, options.retention()).await?;
                metrics::record_recovery(result.recovered);
                recovered = Some(result.recovered);
                if result.recovered {
                    backlog = result.publications;
                }
            } else {
                metrics::record_recovery(false);
                recovered = Some(false);
            }
        }

        if options.presence_enabled {
            let mut info = client.info.clone();
            if let Some(extra) = presence_info {
                info.conn_info = Some(extra);
            }
            self.presence.add_or_refresh(channel, info).await?;
        }

        if options.join_leave_enabled {
            self.broker.publish_join(channel, client.info.clone()).await?;
            *join_sent = true;
        }

        // Flush backlog then buffered live traffic, never interleaved.
        let start_seq = if recovered == Some(true) { since } else { 0 };
        match client.activate(subscription, backlog, start_seq) {
            Ok(position) => Ok(SubscribeOutcome {
                recovered,
                position,
            }),
            Err(_) => Err(NodeError::CapacityExceeded),
        }
    }

    async fn rollback_subscribe(
        &self,
        client: &Arc<LocalClient>,
        channel: &str,
        options: &ChannelOptions,
        join_sent: bool,
    ) {
        client.lock_subscriptions().remove(channel);
        self.remove_member(channel, client.id());
        if options.presence_enabled {
            if let Err(e) = self.presence.remove(channel, client.id()).await {
                warn!(channel = %channel, error = %e, "Presence rollback failed");
            }
        }
        if join_sent {
            if let Err(e) = self.broker.publish_leave(channel, client.info.clone()).await {
                warn!(channel = %channel, error = %e, "Leave broadcast failed");
            }
        }
    }

    async fn broadcast(
        &self,
        channel: &str,
        payload: Bytes,
        options: &ChannelOptions,
    ) -> Result<u64, NodeError> {
        let size = payload.len();
        let publication = Publication::new(channel, payload, self.id.clone());

        let publication = if options.history_enabled() {
            self.history.append(publication, options.retention()).await?
        } else {
            publication
        };
        let seq = publication.seq;

        self.broker.publish(publication).await?;
        metrics::record_publication(size);
        trace!(channel = %channel, seq, "Publication accepted");
        Ok(seq)
    }

    fn remove_member(&self, channel: &str, client_id: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut members) => members.remove(client_id).is_some(),
            None => false,
        };
        self.channels.remove_if(channel, |_, members| members.is_empty());
        metrics::set_active_channels(self.channels.len());
        removed
    }

    async fn remove_subscription(
        &self,
        client: &Arc<LocalClient>,
        channel: &str,
        notify: bool,
    ) -> Result<(), NodeError> {
        if client.lock_subscriptions().remove(channel).is_none() {
            return Err(NodeError::NotSubscribed(channel.to_string()));
        }
        self.remove_member(channel, client.id());

        // Cleanup must not abort halfway: engine failures are logged and
        // retried by the background sweep, not surfaced.
        if let Ok(options) = self.policy.resolve(channel) {
            if options.presence_enabled {
                if let Err(e) = self.presence.remove(channel, client.id()).await {
                    warn!(channel = %channel, client = %client.id(), error = %e, "Presence remove failed");
                }
            }
            if options.join_leave_enabled {
                if let Err(e) = self.broker.publish_leave(channel, client.info.clone()).await {
                    warn!(channel = %channel, error = %e, "Leave broadcast failed");
                }
            }
        }

        self.hooks.on_unsubscribe(&client.info, channel).await;
        if notify {
            let _ = client.send_control(ServerEvent::Unsubscribed {
                channel: channel.to_string(),
            });
        }
        debug!(client = %client.id(), channel = %channel, "Unsubscribed");
        Ok(())
    }

    async fn disconnect_client(self: Arc<Self>, client_id: String, reason: String, forced: bool) -> bool {
        let _guard = self.track();
        let Some((_, client)) = self.clients.remove(&client_id) else {
            return false;
        };
        if forced {
            metrics::record_queue_overflow();
        }

        let channels: Vec<String> = client.lock_subscriptions().keys().cloned().collect();
        for channel in &channels {
            if let Err(e) = self.remove_subscription(&client, channel, false).await {
                debug!(channel = %channel, error = %e, "Subscription cleanup skipped");
            }
        }

        self.hooks.on_disconnect(&client.info, &reason).await;
        let _ = client.send_control(ServerEvent::Disconnect { reason });
        metrics::record_disconnection();
        debug!(client = %client_id, forced, "Client disconnected");
        true
    }

    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Publication(publication) => self.dispatch_publication(publication),
            Envelope::Join { channel, info } => {
                let event = ServerEvent::Join {
                    channel: channel.clone(),
                    info,
                };
                self.dispatch_control(&channel, event);
            }
            Envelope::Leave { channel, info } => {
                let event = ServerEvent::Leave {
                    channel: channel.clone(),
                    info,
                };
                self.dispatch_control(&channel, event);
            }
            Envelope::Unsubscribe { channel, user } => {
                self.force_unsubscribe_user(&channel, &user);
            }
        }
    }

    fn dispatch_publication(self: &Arc<Self>, publication: Publication) {
        let Some(members) = self.channels.get(&publication.channel) else {
            return;
        };
        let mut kicked = Vec::new();
        for (client_id, (client, subscription)) in members.iter() {
            match client.deliver_publication(subscription, publication.clone(), self.buffer_capacity) {
                Delivery::Delivered => metrics::record_delivery("delivered"),
                Delivery::Suppressed => metrics::record_delivery("suppressed"),
                Delivery::Overflow => kicked.push(client_id.clone()),
            }
        }
        drop(members);
        self.kick(kicked);
    }

    fn dispatch_control(self: &Arc<Self>, channel: &str, event: ServerEvent) {
        let Some(members) = self.channels.get(channel) else {
            return;
        };
        let mut kicked = Vec::new();
        for (client_id, (client, _)) in members.iter() {
            if client.send_control(event.clone()) == Delivery::Overflow {
                kicked.push(client_id.clone());
            }
        }
        drop(members);
        self.kick(kicked);
    }

    // A slow subscriber is disconnected instead of backpressuring the
    // publishing path; other subscribers are unaffected.
    fn kick(self: &Arc<Self>, client_ids: Vec<String>) {
        for client_id in client_ids {
            warn!(client = %client_id, "Delivery queue overflow, disconnecting subscriber");
            let inner = self.clone();
            tokio::spawn(async move {
                inner
                    .disconnect_client(client_id, "delivery queue overflow".to_string(), true)
                    .await;
            });
        }
    }

    fn force_unsubscribe_user(self: &Arc<Self>, channel: &str, user: &str) {
        let Some(members) = self.channels.get(channel) else {
            return;
        };
        let targets: Vec<Arc<LocalClient>> = members
            .iter()
            .filter(|(_, (client, _))| client.user() == user)
            .map(|(_, (client, _))| client.clone())
            .collect();
        drop(members);

        for client in targets {
            let inner = self.clone();
            let channel = channel.to_string();
            tokio::spawn(async move {
                let _guard = inner.track();
                if let Err(e) = inner.remove_subscription(&client, &channel, true).await {
                    debug!(channel = %channel, error = %e, "Forced unsubscribe skipped");
                }
            });
        }
    }
}

/// The node's receiving end of the broker control stream.
struct NodeSink {
    inner: Weak<NodeInner>,
}

impl BrokerSink for NodeSink {
    fn handle(&self, envelope: Envelope) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_envelope(envelope);
        }
    }
}
