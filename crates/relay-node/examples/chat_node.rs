//! Minimal chat node.
//!
//! Wires a node with a `chat` namespace (history, recovery, presence,
//! join/leave), logging hooks, and a Prometheus metrics endpoint, then
//! drives a couple of clients until Ctrl-C.
//!
//! ```bash
//! cargo run --example chat_node
//! ```

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_node::{
    ChannelOptions, ClientInfo, EventHooks, NamespaceConfig, Node, NodeConfig, PublishDecision,
    ServerEvent, SubscribeDecision,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct LoggingHooks;

#[async_trait]
impl EventHooks for LoggingHooks {
    async fn on_subscribe(&self, client: &ClientInfo, channel: &str) -> SubscribeDecision {
        tracing::info!(user = %client.user, channel, "subscribe");
        SubscribeDecision::accept()
    }

    async fn on_publish(&self, client: &ClientInfo, channel: &str, payload: &Bytes) -> PublishDecision {
        tracing::info!(user = %client.user, channel, bytes = payload.len(), "publish");
        PublishDecision::Accept
    }

    async fn on_unsubscribe(&self, client: &ClientInfo, channel: &str) {
        tracing::info!(user = %client.user, channel, "unsubscribe");
    }

    async fn on_disconnect(&self, client: &ClientInfo, reason: &str) {
        tracing::info!(user = %client.user, reason, "disconnect");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,chat_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    PrometheusBuilder::new()
        .with_http_listener(([127, 0, 0, 1], 9090))
        .install()?;

    let mut config = NodeConfig::load()?;
    if config.channels.namespaces.is_empty() {
        config.channels.namespaces.push(NamespaceConfig {
            name: "chat".to_string(),
            options: ChannelOptions {
                publish_allowed: true,
                presence_enabled: true,
                join_leave_enabled: true,
                history_size: 1000,
                history_lifetime_secs: 60,
                recovery_enabled: true,
            },
        });
    }

    let node = Node::builder(config).with_hooks(Arc::new(LoggingHooks)).build()?;
    node.run().await?;

    let (alice, mut alice_events) = node.connect("alice", None).await?;
    let (bob, mut bob_events) = node.connect("bob", None).await?;

    node.subscribe(&alice, "chat:lobby", 0).await?;
    node.subscribe(&bob, "chat:lobby", 0).await?;

    tokio::spawn(async move {
        while let Some(event) = alice_events.recv().await {
            if let ServerEvent::Publication(p) = event {
                tracing::info!(seq = p.seq, payload = %String::from_utf8_lossy(&p.payload), "alice got");
            }
        }
    });
    tokio::spawn(async move {
        while let Some(event) = bob_events.recv().await {
            if let ServerEvent::Publication(p) = event {
                tracing::info!(seq = p.seq, payload = %String::from_utf8_lossy(&p.payload), "bob got");
            }
        }
    });

    node.publish_as(&alice, "chat:lobby", &b"hello from alice"[..]).await?;
    node.publish_as(&bob, "chat:lobby", &b"hi alice"[..]).await?;

    let present = node.presence("chat:lobby").await?;
    tracing::info!(members = present.len(), "presence snapshot");

    tokio::signal::ctrl_c().await?;
    node.shutdown(Duration::from_secs(5)).await?;
    tracing::info!("bye!");
    Ok(())
}
