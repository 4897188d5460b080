//! Capability traits a node's engine must provide.
//!
//! These traits define the seam between the node core and the concrete
//! distribution/storage technology, allowing the node to stay agnostic of
//! whether it runs against the in-memory engine, a message bus, or an
//! external store.

use async_trait::async_trait;
use relay_core::{HistoryRetention, PresenceEntry};
use relay_proto::{ClientInfo, Envelope, NodeId, Publication};
use std::sync::Arc;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker was closed.
    #[error("Broker closed")]
    Closed,

    /// The transport refused the message.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Envelope encoding/decoding error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_proto::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store was closed.
    #[error("Store closed")]
    Closed,

    /// Backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result of a history recovery attempt.
///
/// `recovered == false` means the gap could not be closed (or the channel
/// keeps no history) and the caller must fall back to fresh-subscribe
/// semantics. An empty publication list with `recovered == true` means the
/// subscriber was already caught up.
#[derive(Debug, Clone, Default)]
pub struct RecoveredHistory {
    /// Missed publications in ascending sequence order.
    pub publications: Vec<Publication>,
    /// Whether the backlog is gap-free.
    pub recovered: bool,
}

/// Receiver side of a node's broker control stream.
///
/// The node implements this; the broker calls it once per envelope, in
/// per-channel, per-origin order. Implementations must not block: delivery
/// to local subscribers goes through bounded queues.
pub trait BrokerSink: Send + Sync {
    /// Handle one envelope from the cluster.
    fn handle(&self, envelope: Envelope);
}

/// Cross-node fan-out of publications and control events.
///
/// A publication handed to [`Broker::publish`] reaches the local subscriber
/// set of every attached node, the origin included - the node layer never
/// special-cases local delivery. For a single channel, envelopes from one
/// origin are delivered to every node in publish order; ordering across
/// origins is not guaranteed. Once `publish` returns `Ok`, delivery is
/// at-least-once per attached node; duplicate suppression is the receiving
/// node's job, keyed on sequence numbers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Attach a node to the control stream.
    async fn attach(&self, node: NodeId, sink: Arc<dyn BrokerSink>) -> Result<(), BrokerError>;

    /// Detach a node from the control stream.
    async fn detach(&self, node: &NodeId) -> Result<(), BrokerError>;

    /// Fan a publication out to every attached node.
    ///
    /// An error means the transport did not accept the message; the caller
    /// decides whether to retry or drop.
    async fn publish(&self, publication: Publication) -> Result<(), BrokerError>;

    /// Broadcast a join event for a channel.
    async fn publish_join(&self, channel: &str, info: ClientInfo) -> Result<(), BrokerError>;

    /// Broadcast a leave event for a channel.
    async fn publish_leave(&self, channel: &str, info: ClientInfo) -> Result<(), BrokerError>;

    /// Broadcast a cluster-wide unsubscribe of a user from a channel.
    async fn publish_unsubscribe(&self, channel: &str, user: &str) -> Result<(), BrokerError>;

    /// Get the broker name (e.g. "memory").
    fn name(&self) -> &'static str;

    /// Close the broker after pending operations settle.
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Durable per-channel history with atomic sequencing.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Assign the next sequence number for the publication's channel, store
    /// the entry, and evict beyond the retention limits.
    ///
    /// Appends to the same channel are serialized by the store: no two
    /// appends observe the same sequence number. Independent channels do
    /// not contend.
    async fn append(
        &self,
        publication: Publication,
        retention: HistoryRetention,
    ) -> Result<Publication, StoreError>;

    /// Return retained publications with sequence number greater than
    /// `since`, in ascending order.
    async fn recover(
        &self,
        channel: &str,
        since: u64,
        retention: HistoryRetention,
    ) -> Result<RecoveredHistory, StoreError>;

    /// Close the store after pending operations settle.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Shared presence registry with liveness expiry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add a subscriber to a channel or refresh its liveness timestamp.
    async fn add_or_refresh(&self, channel: &str, info: ClientInfo) -> Result<(), StoreError>;

    /// Remove one subscriber entry. Absent entries are a no-op.
    async fn remove(&self, channel: &str, client: &str) -> Result<(), StoreError>;

    /// All entries still within the liveness window. Never returns a stale
    /// entry.
    async fn snapshot(&self, channel: &str) -> Result<Vec<PresenceEntry>, StoreError>;

    /// Evict entries outside the liveness window across all channels.
    ///
    /// Returns the number of evicted entries.
    async fn sweep(&self) -> Result<usize, StoreError>;

    /// Close the store after pending operations settle.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
