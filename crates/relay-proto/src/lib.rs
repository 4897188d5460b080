//! # relay-proto
//!
//! Cluster wire types for the Relay realtime pub/sub node.
//!
//! This crate defines the messages nodes exchange through a broker:
//! sequenced publications plus the join/leave/unsubscribe control events.
//! Envelopes are serialized with MessagePack behind a length prefix, so any
//! broker backend that moves ordered byte streams per channel can carry them.
//!
//! ## Envelope kinds
//!
//! - `Publication` - a sequenced message for channel subscribers
//! - `Join` / `Leave` - presence transitions broadcast to the cluster
//! - `Unsubscribe` - server-initiated unsubscribe of a user, cluster-wide
//!
//! ## Example
//!
//! ```rust
//! use relay_proto::{codec, Envelope, NodeId, Publication};
//!
//! let publication = Publication::new("chat:lobby", b"hello".to_vec(), NodeId::generate());
//! let envelope = Envelope::Publication(publication);
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{ClientInfo, Envelope, NodeId, Publication};
