//! The base protocol.
//!
//! Runs in the reserved code window `[0, BASE_PROTOCOL_LENGTH)` on every
//! connection. It owns the hello exchange (which starts the negotiated
//! subprotocols), the ping/pong keepalive, disconnect reason delivery, and
//! peer address gossip.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use weft_core::serialization::{deserialize, serialize};

use crate::config::{BASE_PROTOCOL_LENGTH, PROTOCOL_VERSION};
use crate::error::{DiscReason, P2pResult, PeerError};
use crate::mux::{ProtoChannel, Subprotocol};
use crate::peer::{HandshakeInfo, Peer};
use crate::protocol::caps::Capability;
use crate::protocol::messages::{
    DisconnectMessage, HelloMessage, PeerAddress, PeersMessage, DISCONNECT_MSG, GET_PEERS_MSG,
    HELLO_MSG, PEERS_MSG, PING_MSG, PONG_MSG,
};
use crate::server::ServerHooks;

/// Name the base protocol is registered under. Not negotiable: it always
/// runs at offset zero.
pub const BASE_PROTO_NAME: &str = "p2p";

/// Upper bound on addresses per peers message, in either direction.
const MAX_PEERS_PER_MESSAGE: usize = 256;

/// The base protocol implementation.
#[derive(Debug, Default)]
pub struct BaseProtocol;

impl BaseProtocol {
    /// Create the base protocol.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subprotocol for BaseProtocol {
    fn capability(&self) -> Capability {
        Capability::new(BASE_PROTO_NAME, PROTOCOL_VERSION)
    }

    fn code_span(&self) -> u64 {
        BASE_PROTOCOL_LENGTH
    }

    async fn run(&self, peer: Arc<Peer>, link: ProtoChannel) -> P2pResult<()> {
        run_base_protocol(peer, link).await
    }
}

async fn run_base_protocol(peer: Arc<Peer>, mut link: ProtoChannel) -> P2pResult<()> {
    let hooks = peer.hooks().clone();
    let config = peer.config().clone();

    // Advertise ourselves before reading anything.
    let hello = HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        client_id: hooks.identity().client_id().to_string(),
        caps: {
            let mut caps = peer.local_caps();
            caps.sort();
            caps
        },
        listen_port: hooks.our_listen_addr().map(|a| a.port).unwrap_or(0),
        node_id: hooks.identity().public_key(),
    };
    link.send(HELLO_MSG, serialize(&hello)?.into()).await?;

    let activity = peer.activity_watch();
    let mut hello_received = false;
    let mut awaiting_pong = false;
    let mut ping_sent_at = Instant::now();
    let hello_deadline = Instant::now() + config.handshake_timeout;

    loop {
        let deadline = if !hello_received {
            hello_deadline
        } else if awaiting_pong {
            ping_sent_at + config.inactivity_timeout
        } else {
            *activity.borrow() + config.inactivity_timeout
        };

        tokio::select! {
            maybe_msg = link.recv() => {
                let Some(mut msg) = maybe_msg else {
                    // Queue closed: the peer is shutting down.
                    return Ok(());
                };
                let payload = msg.payload.read_all().await?;

                if !hello_received && msg.code != HELLO_MSG {
                    return Err(PeerError::breach(
                        DiscReason::ProtocolError,
                        format!("message {} before hello", msg.code),
                    ));
                }

                match msg.code {
                    HELLO_MSG if hello_received => {
                        return Err(PeerError::breach(
                            DiscReason::ProtocolError,
                            "duplicate hello",
                        ));
                    }
                    HELLO_MSG => {
                        handle_hello(&peer, &hooks, &payload)?;
                        hello_received = true;
                    }
                    DISCONNECT_MSG => {
                        let disc: DisconnectMessage = deserialize(&payload)?;
                        tracing::debug!(peer = %peer, reason = %disc.reason, "remote requested disconnect");
                        return Err(PeerError::Disconnected(disc.reason));
                    }
                    PING_MSG => {
                        link.send(PONG_MSG, Bytes::new()).await?;
                    }
                    PONG_MSG => {
                        awaiting_pong = false;
                    }
                    GET_PEERS_MSG => {
                        let peers: Vec<PeerAddress> = hooks
                            .other_peers()
                            .into_iter()
                            .filter_map(|p| {
                                p.listen_addr.map(|mut addr| {
                                    addr.pubkey = Some(p.node_id);
                                    addr
                                })
                            })
                            .take(MAX_PEERS_PER_MESSAGE)
                            .collect();
                        link.send(PEERS_MSG, serialize(&PeersMessage { peers })?.into())
                            .await?;
                    }
                    PEERS_MSG => {
                        let msg: PeersMessage = deserialize(&payload)?;
                        for addr in msg.peers.into_iter().take(MAX_PEERS_PER_MESSAGE) {
                            match hooks.verify_pubkey(&addr) {
                                Ok(()) => hooks.announce_peer(addr),
                                Err(err) => {
                                    tracing::debug!(peer = %peer, addr = %addr, error = %err, "ignoring gossiped address");
                                }
                            }
                        }
                    }
                    code => return Err(PeerError::InvalidMsgCode(code)),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if !hello_received {
                    return Err(PeerError::breach(
                        DiscReason::ProtocolError,
                        "no hello within deadline",
                    ));
                }
                if awaiting_pong {
                    return Err(PeerError::PingTimeout);
                }
                // The deadline was computed from an older activity stamp;
                // only probe if the line has really been quiet.
                let last = *activity.borrow();
                if last.elapsed() >= config.inactivity_timeout {
                    link.send(PING_MSG, Bytes::new()).await?;
                    awaiting_pong = true;
                    ping_sent_at = Instant::now();
                }
            }
        }
    }
}

fn handle_hello(peer: &Arc<Peer>, hooks: &ServerHooks, payload: &[u8]) -> P2pResult<()> {
    let hello: HelloMessage = deserialize(payload)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(PeerError::breach(
            DiscReason::IncompatibleVersion,
            format!(
                "remote speaks version {}, we speak {}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }
    if hello.node_id == hooks.identity().public_key() {
        return Err(PeerError::breach(
            DiscReason::ConnectedToSelf,
            "remote identity is our own",
        ));
    }
    if let Some(authenticated) = peer.authenticated_identity() {
        if authenticated != hello.node_id {
            return Err(PeerError::breach(
                DiscReason::UnexpectedIdentity,
                "hello identity does not match the channel identity",
            ));
        }
    }
    if let Some(dialed) = peer.dial_addr().and_then(|a| a.pubkey.clone()) {
        if dialed != hello.node_id {
            return Err(PeerError::breach(
                DiscReason::UnexpectedIdentity,
                "hello identity does not match the dialed key",
            ));
        }
    }
    if hooks
        .other_peers()
        .iter()
        .any(|p| p.node_id == hello.node_id)
    {
        return Err(PeerError::breach(
            DiscReason::DuplicateConnection,
            "already connected to this node",
        ));
    }

    let listen_addr = (hello.listen_port != 0).then(|| {
        PeerAddress::new(
            peer.remote_addr().ip(),
            hello.listen_port,
            Some(hello.node_id.clone()),
        )
    });
    let check_addr = listen_addr.clone().unwrap_or_else(|| {
        PeerAddress::from_socket_addr(peer.remote_addr(), Some(hello.node_id.clone()))
    });
    hooks.verify_pubkey(&check_addr).map_err(|err| match err {
        breach @ PeerError::Breach { .. } => breach,
        other => PeerError::breach(DiscReason::UnexpectedIdentity, other.to_string()),
    })?;

    tracing::info!(
        peer = %peer,
        client = %hello.client_id,
        caps = %hello.caps.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        "hello received"
    );

    peer.set_handshake_info(HandshakeInfo {
        identity: hello.node_id.clone(),
        client_id: hello.client_id.clone(),
        listen_addr,
        caps: hello.caps.clone(),
    });
    peer.start_subprotocols(&hello.caps);
    Ok(())
}
