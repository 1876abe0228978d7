//! Base protocol: message types, capabilities, and the built-in runner.

pub mod base;
pub mod caps;
pub mod messages;

pub use base::{BaseProtocol, BASE_PROTO_NAME};
pub use caps::{negotiate, Capability};
pub use messages::{
    DisconnectMessage, HelloMessage, PeerAddress, PeersMessage, DISCONNECT_MSG, GET_PEERS_MSG,
    HELLO_MSG, PEERS_MSG, PING_MSG, PONG_MSG,
};
