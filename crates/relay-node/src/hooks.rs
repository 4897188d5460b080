//! Lifecycle extension points.
//!
//! The connection layer customizes node behavior by implementing
//! [`EventHooks`]: one method per lifecycle event, each returning a typed
//! decision. Every method has an accept-all default, so implementations
//! override only what they care about.

use async_trait::async_trait;
use bytes::Bytes;
use relay_proto::ClientInfo;

/// Decision returned by [`EventHooks::on_connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Accept the connection, optionally attaching opaque metadata that
    /// replaces whatever the connection layer supplied.
    Accept {
        /// Metadata carried in the client's identity from here on.
        info: Option<Bytes>,
    },
    /// Reject the connection.
    Reject {
        /// Reason surfaced to the caller.
        reason: String,
    },
}

impl ConnectDecision {
    /// Plain acceptance without metadata.
    #[must_use]
    pub fn accept() -> Self {
        Self::Accept { info: None }
    }
}

/// Decision returned by [`EventHooks::on_subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeDecision {
    /// Accept the subscription, optionally overriding the metadata exposed
    /// through the channel's presence entry.
    Accept {
        /// Presence metadata override.
        presence_info: Option<Bytes>,
    },
    /// Reject the subscription.
    Reject {
        /// Reason surfaced to the caller.
        reason: String,
    },
}

impl SubscribeDecision {
    /// Plain acceptance without a presence override.
    #[must_use]
    pub fn accept() -> Self {
        Self::Accept {
            presence_info: None,
        }
    }
}

/// Decision returned by [`EventHooks::on_publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDecision {
    /// Accept the publication.
    Accept,
    /// Reject the publication.
    Reject {
        /// Reason surfaced to the caller.
        reason: String,
    },
}

/// Lifecycle hooks invoked by the node core.
///
/// Hooks run on the calling task before the operation's side effects; a
/// rejection leaves no trace in history, presence, or the broker.
#[async_trait]
pub trait EventHooks: Send + Sync {
    /// A client wants to connect.
    async fn on_connect(&self, user: &str, conn_info: Option<&Bytes>) -> ConnectDecision {
        let _ = (user, conn_info);
        ConnectDecision::accept()
    }

    /// A client wants to subscribe to a channel.
    async fn on_subscribe(&self, client: &ClientInfo, channel: &str) -> SubscribeDecision {
        let _ = (client, channel);
        SubscribeDecision::accept()
    }

    /// A client wants to publish into a channel.
    async fn on_publish(&self, client: &ClientInfo, channel: &str, payload: &Bytes) -> PublishDecision {
        let _ = (client, channel, payload);
        PublishDecision::Accept
    }

    /// A client's subscription was removed.
    async fn on_unsubscribe(&self, client: &ClientInfo, channel: &str) {
        let _ = (client, channel);
    }

    /// A client disconnected.
    async fn on_disconnect(&self, client: &ClientInfo, reason: &str) {
        let _ = (client, reason);
    }
}

/// Accept-everything hooks, used when none are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl EventHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_hooks_accept_everything() {
        let hooks = NoopHooks;
        let info = ClientInfo::new("42", "conn-1");

        assert_eq!(
            hooks.on_connect("42", None).await,
            ConnectDecision::accept()
        );
        assert_eq!(
            hooks.on_subscribe(&info, "chat:lobby").await,
            SubscribeDecision::accept()
        );
        assert_eq!(
            hooks.on_publish(&info, "chat:lobby", &Bytes::from_static(b"x")).await,
            PublishDecision::Accept
        );
    }
}
