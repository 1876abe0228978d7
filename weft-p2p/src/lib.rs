//! Peer connection core for the Weft protocol.
//!
//! This crate turns one raw TCP-style byte stream into a multiplexed,
//! message-oriented, optionally encrypted channel shared by several
//! application subprotocols:
//!
//! - Framed messaging with streaming payloads and strict one-frame-at-a-time
//!   backpressure
//! - An optional authenticated encrypted channel (X25519 handshake,
//!   AES-256-CTR with HMAC-SHA256 records)
//! - Capability negotiation mapping message-code windows to subprotocols
//! - The built-in base protocol: hello, ping/pong keepalive, disconnect
//!   reasons, peer address gossip
//! - Orderly teardown with a disconnect grace period on every exit path
//!
//! # Architecture
//!
//! Each peer is a handful of cooperating tasks communicating over bounded
//! channels:
//!
//! ```text
//! Peer Task (Peer::run)
//! ├── Framer reader task (socket reads, gated by read-permission tokens)
//! ├── Framer writer task (serializes all outbound frames)
//! ├── Base protocol task (hello, keepalive, gossip)
//! └── One task per negotiated subprotocol
//! ```
//!
//! The hosting server supplies connections, the local identity, and a few
//! callbacks through [`ServerHooks`]; discovery and the peer table live
//! outside this crate.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use weft_core::ClientIdentity;
//! use weft_p2p::{Peer, PeerConfig, ServerHooks};
//!
//! let hooks = ServerHooks::new(ClientIdentity::generate("weft/0.1.0"));
//! let config = PeerConfig::new().with_encryption(true);
//! let peer = Peer::new(stream, remote_addr, local_addr, None, protocols, hooks, config);
//! let (reason, error) = peer.run().await;
//! ```

pub mod config;
pub mod error;

pub mod framing;
pub mod mux;
pub mod peer;
pub mod protocol;
pub mod secure;
pub mod server;

// Re-export main types
pub use config::{
    PeerConfig, BASE_PROTOCOL_LENGTH, DISCONNECT_GRACE_PERIOD, HANDSHAKE_TIMEOUT,
    INACTIVITY_TIMEOUT, MAX_MESSAGE_SIZE, PROTOCOL_VERSION, WHOLE_PAYLOAD_SIZE,
};
pub use error::{disc_reason_for_error, DiscReason, P2pResult, PeerError};
pub use framing::{Msg, MsgWriter, Payload, PayloadReader, TrafficSnapshot};
pub use mux::{ProtoChannel, ProtoWriter, Subprotocol};
pub use peer::{Conn, HandshakeInfo, Peer};
pub use protocol::{Capability, HelloMessage, PeerAddress};
pub use server::{PeerSummary, ServerHooks};
