//! # relay-engine
//!
//! Broker and store abstraction layer for the Relay realtime engine.
//!
//! A node owns three capabilities, each behind a trait so the backing
//! technology stays swappable:
//!
//! - **Broker** - cross-node fan-out of publications and control events
//! - **HistoryStore** - durable per-channel history with atomic sequencing
//! - **PresenceStore** - shared presence registry with liveness expiry
//!
//! The bundled [`MemoryEngine`] implements all three in process. It serves
//! a single node, and doubles as an in-process cluster bus when shared by
//! several nodes (every attached node receives every envelope, the origin
//! included). Transport- or store-backed engines implement the same traits
//! and move [`relay_proto::Envelope`] bytes through the `relay-proto` codec.
//!
//! ```rust,ignore
//! use relay_engine::{Broker, MemoryEngine};
//! use std::sync::Arc;
//!
//! let engine = Arc::new(MemoryEngine::default());
//! engine.attach(node_id, sink).await?;
//! engine.publish(publication).await?;
//! ```

pub mod memory;
pub mod traits;

pub use memory::MemoryEngine;
pub use traits::{
    Broker, BrokerError, BrokerSink, HistoryStore, PresenceStore, RecoveredHistory, StoreError,
};
