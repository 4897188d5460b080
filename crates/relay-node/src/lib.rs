//! # relay-node
//!
//! Node core of the Relay realtime pub/sub engine.
//!
//! A node owns its local subscriber set and orchestrates four collaborators:
//! the channel policy registry, the history log, the presence registry, and
//! the broker that fans publications out across the cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   connect/subscribe/publish   ┌────────────┐
//! │ Connection │──────────────────────────────▶│    Node    │
//! │   layer    │◀──────── ServerEvent ─────────│            │
//! └────────────┘                               └─────┬──────┘
//!                                                    │
//!                     ┌───────────────┬──────────────┼──────────────┐
//!                     ▼               ▼              ▼              ▼
//!              ┌────────────┐  ┌────────────┐ ┌────────────┐ ┌───────────┐
//!              │   Policy   │  │  History   │ │  Presence  │ │  Broker   │
//!              └────────────┘  └────────────┘ └────────────┘ └───────────┘
//! ```
//!
//! A publish resolves policy, appends to history to obtain its sequence
//! number, then goes through the broker - local delivery included, so every
//! node (the origin too) observes the same per-channel order. A
//! reconnecting subscriber passes its last seen sequence number and gets
//! the missed backlog flushed ahead of live traffic, or a fresh
//! subscription when the gap cannot be closed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use relay_node::{Node, NodeConfig};
//!
//! let node = Node::new(NodeConfig::load()?)?;
//! node.run().await?;
//!
//! let (client, mut events) = node.connect("42", None).await?;
//! node.subscribe(&client, "chat:lobby", 0).await?;
//! node.publish("chat:lobby", &b"hello"[..]).await?;
//! ```

pub mod client;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod node;

pub use client::ServerEvent;
pub use config::{ChannelsConfig, DeliveryConfig, NamespaceConfig, NodeConfig, PresenceConfig};
pub use hooks::{ConnectDecision, EventHooks, NoopHooks, PublishDecision, SubscribeDecision};
pub use node::{Node, NodeBuilder, NodeError, NodeStats, SubscribeOutcome};

pub use relay_core::{ChannelOptions, PresenceEntry};
pub use relay_engine::{Broker, HistoryStore, MemoryEngine, PresenceStore, RecoveredHistory};
pub use relay_proto::{ClientInfo, NodeId, Publication};
