//! # relay-core
//!
//! Channel-level building blocks for the Relay realtime pub/sub node.
//!
//! This crate provides the per-channel data structures the engine layer
//! serves behind its store traits, plus the policy registry that maps
//! channel names to their effective options:
//!
//! - **PolicyRegistry** - namespace-prefix resolution of channel options
//! - **ChannelHistory** - bounded, ordered log with monotonic sequences
//! - **ChannelPresence** - live subscriber set with liveness expiry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌────────────────┐
//! │  Node Core  │────▶│  PolicyRegistry  │     │ ChannelHistory │
//! └─────────────┘     └──────────────────┘     └────────────────┘
//!        │                                              ▲
//!        ▼                                              │
//! ┌─────────────┐                              ┌────────────────┐
//! │   Engine    │─────────────────────────────▶│ChannelPresence │
//! └─────────────┘                              └────────────────┘
//! ```
//!
//! Everything here is synchronous and single-channel; serving many channels
//! concurrently is the engine's concern.

pub mod history;
pub mod policy;
pub mod presence;

pub use history::{ChannelHistory, HistoryRetention};
pub use policy::{validate_channel_name, ChannelOptions, PolicyError, PolicyRegistry};
pub use presence::{ChannelPresence, PresenceEntry};
