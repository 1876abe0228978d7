//! P2P error types and wire disconnect reasons.

use std::fmt;
use std::io;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Reason carried in a disconnect message.
///
/// Wire ordinals are stable and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DiscReason {
    /// Disconnect was requested locally.
    RequestedDisconnect = 0x00,
    /// The underlying transport failed.
    NetworkError = 0x01,
    /// The peer violated the protocol.
    ProtocolError = 0x02,
    /// The peer is of no use to us.
    UselessPeer = 0x03,
    /// We have too many peers already.
    TooManyPeers = 0x04,
    /// We are already connected to this node.
    DuplicateConnection = 0x05,
    /// The peer speaks an incompatible base protocol version.
    IncompatibleVersion = 0x06,
    /// The peer presented an invalid node identity.
    InvalidIdentity = 0x07,
    /// The client is shutting down.
    ClientQuitting = 0x08,
    /// The peer's identity does not match what we expected.
    UnexpectedIdentity = 0x09,
    /// The connection turned out to be to ourselves.
    ConnectedToSelf = 0x0a,
    /// The peer stopped answering pings.
    PingTimeout = 0x0b,
    /// A subprotocol asked for the disconnect.
    SubprotocolReason = 0x10,
}

impl DiscReason {
    /// The stable wire ordinal for this reason.
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Decode a wire ordinal, if it names a known reason.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(DiscReason::RequestedDisconnect),
            0x01 => Some(DiscReason::NetworkError),
            0x02 => Some(DiscReason::ProtocolError),
            0x03 => Some(DiscReason::UselessPeer),
            0x04 => Some(DiscReason::TooManyPeers),
            0x05 => Some(DiscReason::DuplicateConnection),
            0x06 => Some(DiscReason::IncompatibleVersion),
            0x07 => Some(DiscReason::InvalidIdentity),
            0x08 => Some(DiscReason::ClientQuitting),
            0x09 => Some(DiscReason::UnexpectedIdentity),
            0x0a => Some(DiscReason::ConnectedToSelf),
            0x0b => Some(DiscReason::PingTimeout),
            0x10 => Some(DiscReason::SubprotocolReason),
            _ => None,
        }
    }
}

impl fmt::Display for DiscReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscReason::RequestedDisconnect => "disconnect requested",
            DiscReason::NetworkError => "network error",
            DiscReason::ProtocolError => "breach of protocol",
            DiscReason::UselessPeer => "useless peer",
            DiscReason::TooManyPeers => "too many peers",
            DiscReason::DuplicateConnection => "already connected",
            DiscReason::IncompatibleVersion => "incompatible protocol version",
            DiscReason::InvalidIdentity => "invalid node identity",
            DiscReason::ClientQuitting => "client quitting",
            DiscReason::UnexpectedIdentity => "unexpected identity",
            DiscReason::ConnectedToSelf => "connected to self",
            DiscReason::PingTimeout => "ping timeout",
            DiscReason::SubprotocolReason => "subprotocol reason",
        };
        write!(f, "{}", s)
    }
}

impl Serialize for DiscReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for DiscReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        DiscReason::from_wire(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown disconnect reason {value:#x}")))
    }
}

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum PeerError {
    /// A message code fell outside every running protocol's window.
    #[error("invalid message code {0}")]
    InvalidMsgCode(u64),

    /// A message payload could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMsg(String),

    /// The byte stream violated the frame format.
    #[error("framing violation: {0}")]
    Frame(String),

    /// The peer disagreed with us during the hello exchange, or an
    /// identity check failed.
    #[error("protocol breach: {detail}")]
    Breach {
        /// The disconnect reason this breach maps to.
        reason: DiscReason,
        /// Human-readable detail for logs.
        detail: String,
    },

    /// The peer stopped answering pings.
    #[error("ping timeout")]
    PingTimeout,

    /// The underlying transport failed.
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// The crypto handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The remote end sent a disconnect message.
    #[error("remote disconnected: {0}")]
    Disconnected(DiscReason),

    /// Catch-all for subprotocol failures.
    #[error("{0}")]
    Misc(String),
}

impl PeerError {
    /// Convenience constructor for hello-phase breaches.
    pub fn breach(reason: DiscReason, detail: impl Into<String>) -> Self {
        PeerError::Breach {
            reason,
            detail: detail.into(),
        }
    }
}

impl From<weft_core::SerializationError> for PeerError {
    fn from(err: weft_core::SerializationError) -> Self {
        PeerError::InvalidMsg(err.to_string())
    }
}

/// Map an internal error to the disconnect reason sent to the peer.
///
/// Total: every error maps to some reason; subprotocol failures default to
/// [`DiscReason::SubprotocolReason`].
pub fn disc_reason_for_error(err: &PeerError) -> DiscReason {
    match err {
        PeerError::InvalidMsgCode(_) | PeerError::InvalidMsg(_) | PeerError::Frame(_) => {
            DiscReason::ProtocolError
        }
        PeerError::Breach { reason, .. } => *reason,
        PeerError::PingTimeout => DiscReason::PingTimeout,
        PeerError::Network(_) => DiscReason::NetworkError,
        PeerError::Handshake(_) => DiscReason::ProtocolError,
        PeerError::Disconnected(reason) => *reason,
        PeerError::Misc(_) => DiscReason::SubprotocolReason,
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, PeerError>;
