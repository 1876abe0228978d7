//! Base protocol messages.
//!
//! The base protocol owns codes 0 through 5 inside the reserved window
//! `[0, BASE_PROTOCOL_LENGTH)`. Payloads are deterministic bincode.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use weft_core::PublicKey;

use crate::error::DiscReason;
use crate::protocol::Capability;

/// Hello: first message on every connection.
pub const HELLO_MSG: u64 = 0x00;
/// Disconnect: carries the reason, sent before closing.
pub const DISCONNECT_MSG: u64 = 0x01;
/// Ping: keepalive probe.
pub const PING_MSG: u64 = 0x02;
/// Pong: keepalive answer.
pub const PONG_MSG: u64 = 0x03;
/// GetPeers: ask for known peer addresses.
pub const GET_PEERS_MSG: u64 = 0x04;
/// Peers: a batch of peer addresses.
pub const PEERS_MSG: u64 = 0x05;

/// A peer's network address with an optional node key.
///
/// Equality and hashing consider only `(ip, port)`; the key is advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    /// IP address (v4 or v6).
    pub ip: IpAddr,
    /// TCP port.
    pub port: u16,
    /// The node's public key, when known.
    pub pubkey: Option<PublicKey>,
}

impl PeerAddress {
    /// Create a peer address.
    pub fn new(ip: IpAddr, port: u16, pubkey: Option<PublicKey>) -> Self {
        Self { ip, port, pubkey }
    }

    /// Build from a socket address.
    pub fn from_socket_addr(addr: SocketAddr, pubkey: Option<PublicKey>) -> Self {
        Self::new(addr.ip(), addr.port(), pubkey)
    }

    /// The `(ip, port)` pair as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for PeerAddress {}

impl std::hash::Hash for PeerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    // SocketAddr formats IPv6 with brackets; peer addresses use the same
    // canonical form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Hello payload: what each side advertises right after the channel is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Base protocol version.
    pub protocol_version: u32,
    /// Client descriptor, e.g. `weft/0.1.0/linux`.
    pub client_id: String,
    /// Advertised subprotocols.
    pub caps: Vec<Capability>,
    /// TCP port the sender accepts connections on; 0 when not listening.
    pub listen_port: u16,
    /// The sender's node key.
    pub node_id: PublicKey,
}

/// Disconnect payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectMessage {
    /// Why the sender is going away.
    pub reason: DiscReason,
}

/// Peers payload: gossip of known peer addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersMessage {
    /// Known peer addresses.
    pub peers: Vec<PeerAddress>,
}
