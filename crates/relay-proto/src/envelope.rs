//! Envelope types for cross-node traffic.
//!
//! Everything one node learns about another node's activity arrives as an
//! [`Envelope`] delivered by the broker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a node instance within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node ID from an explicit name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique node ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(format!("node_{timestamp:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a subscriber: the user it authenticated as plus the unique
/// connection it arrived on, with optional opaque metadata supplied by the
/// connection layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// User identifier (shared across a user's connections).
    pub user: String,
    /// Unique connection identifier.
    pub client: String,
    /// Opaque per-connection metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Bytes>,
}

impl ClientInfo {
    /// Create a client identity.
    #[must_use]
    pub fn new(user: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            client: client.into(),
            conn_info: None,
        }
    }

    /// Attach opaque connection metadata.
    #[must_use]
    pub fn with_conn_info(mut self, conn_info: impl Into<Bytes>) -> Self {
        self.conn_info = Some(conn_info.into());
        self
    }
}

/// One published message instance.
///
/// `seq` is assigned by the history log and is monotonic per channel,
/// starting at 1. A publication on a channel without history carries
/// `seq == 0` and is exempt from duplicate suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Target channel.
    pub channel: String,
    /// Per-channel sequence number (0 when the channel keeps no history).
    pub seq: u64,
    /// Message payload (shared for zero-copy fan-out).
    pub payload: Bytes,
    /// Node that accepted the publish.
    pub origin: NodeId,
    /// Wall-clock creation time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Publication {
    /// Create an unsequenced publication.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>, origin: NodeId) -> Self {
        Self {
            channel: channel.into(),
            seq: 0,
            payload: payload.into(),
            origin,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// A message exchanged between cluster nodes through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// A sequenced publication for channel subscribers.
    #[serde(rename = "publication")]
    Publication(Publication),

    /// A subscriber joined a channel somewhere in the cluster.
    #[serde(rename = "join")]
    Join {
        /// Channel the subscriber joined.
        channel: String,
        /// Joining subscriber's identity.
        info: ClientInfo,
    },

    /// A subscriber left a channel somewhere in the cluster.
    #[serde(rename = "leave")]
    Leave {
        /// Channel the subscriber left.
        channel: String,
        /// Leaving subscriber's identity.
        info: ClientInfo,
    },

    /// Server-initiated unsubscribe of every connection of a user.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Channel to unsubscribe from.
        channel: String,
        /// User whose connections must be unsubscribed.
        user: String,
    },
}

impl Envelope {
    /// Get the channel this envelope concerns.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            Envelope::Publication(p) => &p.channel,
            Envelope::Join { channel, .. }
            | Envelope::Leave { channel, .. }
            | Envelope::Unsubscribe { channel, .. } => channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation() {
        let id1 = NodeId::generate();
        let id2 = NodeId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("node_"));
    }

    #[test]
    fn test_publication_creation() {
        let p = Publication::new("chat:lobby", b"hello".to_vec(), NodeId::new("n1"));
        assert_eq!(p.channel, "chat:lobby");
        assert_eq!(p.seq, 0);
        assert_eq!(&p.payload[..], b"hello");
        assert_eq!(p.payload_size(), 5);
    }

    #[test]
    fn test_client_info() {
        let info = ClientInfo::new("42", "conn-1").with_conn_info(b"{\"name\":\"Alexander\"}".to_vec());
        assert_eq!(info.user, "42");
        assert_eq!(info.client, "conn-1");
        assert!(info.conn_info.is_some());
    }

    #[test]
    fn test_envelope_channel() {
        let p = Publication::new("news", b"x".to_vec(), NodeId::new("n1"));
        assert_eq!(Envelope::Publication(p).channel(), "news");

        let join = Envelope::Join {
            channel: "chat:lobby".to_string(),
            info: ClientInfo::new("42", "conn-1"),
        };
        assert_eq!(join.channel(), "chat:lobby");
    }
}
