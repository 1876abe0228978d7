//! Peer connection state machine.
//!
//! One [`Peer`] owns one remote connection from handshake to teardown:
//!
//! 1. Crypto handshake (or plaintext wrap), deadline-bounded.
//! 2. Base protocol hello exchange, which starts the negotiated
//!    subprotocols.
//! 3. The main loop: dispatch inbound messages, hand out read-permission
//!    tokens, watch for errors and disconnect requests.
//! 4. Graceful disconnect (write the reason, wait the grace period) or, on
//!    transport and handshake failures, an immediate close with no goodbye.
//!
//! Every exit path runs the same teardown: stop the activity bus, close all
//! subprotocol queues and join their tasks, fire the closed broadcast, then
//! close the socket and framer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

use weft_core::PublicKey;

use crate::config::{PeerConfig, BASE_PROTOCOL_LENGTH};
use crate::error::{disc_reason_for_error, DiscReason, P2pResult, PeerError};
use crate::framing::{
    FrameLimits, Messenger, Msg, MsgWriter, Payload, TrafficSnapshot, TrafficStats,
};
use crate::mux::{Mux, ProtoChannel, ProtoWriter, Subprotocol};
use crate::protocol::{
    negotiate, BaseProtocol, Capability, DisconnectMessage, PeerAddress, BASE_PROTO_NAME,
    DISCONNECT_MSG, PING_MSG,
};
use crate::secure;
use crate::server::ServerHooks;

/// Transport requirements for a peer connection.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// What the hello exchange learned about the remote end.
///
/// Published atomically: readers see either nothing or the complete triple.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// The remote node's key.
    pub identity: PublicKey,
    /// The remote client descriptor.
    pub client_id: String,
    /// Where the remote accepts connections, if it listens.
    pub listen_addr: Option<PeerAddress>,
    /// The remote's advertised capabilities.
    pub caps: Vec<Capability>,
}

/// Identity authenticated by the encrypted channel handshake.
#[derive(Debug, Clone)]
struct SecureInfo {
    token: [u8; 32],
    identity: PublicKey,
}

/// A connection to a remote peer.
pub struct Peer {
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    dial_addr: Option<PeerAddress>,
    config: PeerConfig,
    hooks: ServerHooks,
    protocols: Vec<Arc<dyn Subprotocol>>,

    conn: Mutex<Option<Box<dyn Conn>>>,
    writer: Mutex<Option<MsgWriter>>,
    info: Mutex<Option<HandshakeInfo>>,
    secure: Mutex<Option<SecureInfo>>,
    mux: Mux,
    stats: Arc<TrafficStats>,

    disc_tx: mpsc::Sender<DiscReason>,
    disc_rx: Mutex<Option<mpsc::Receiver<DiscReason>>>,
    proto_err_tx: mpsc::Sender<PeerError>,
    proto_err_rx: Mutex<Option<mpsc::Receiver<PeerError>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    activity_tx: Mutex<Option<watch::Sender<Instant>>>,
    activity_rx: watch::Receiver<Instant>,
}

impl Peer {
    /// Create a peer over a live connection.
    ///
    /// `local_addr` is the local end of the socket, captured by the caller
    /// before handing the connection over (in-memory transports have none).
    /// `dial_addr` is set when we initiated the connection; it makes this
    /// side the handshake initiator and pins the expected remote key when
    /// the address carries one.
    pub fn new(
        conn: impl Conn + 'static,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        dial_addr: Option<PeerAddress>,
        protocols: Vec<Arc<dyn Subprotocol>>,
        hooks: ServerHooks,
        config: PeerConfig,
    ) -> Arc<Self> {
        let (disc_tx, disc_rx) = mpsc::channel(1);
        let (proto_err_tx, proto_err_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (activity_tx, activity_rx) = watch::channel(Instant::now());

        Arc::new(Self {
            remote_addr,
            local_addr,
            dial_addr,
            config,
            hooks,
            protocols,
            conn: Mutex::new(Some(Box::new(conn))),
            writer: Mutex::new(None),
            info: Mutex::new(None),
            secure: Mutex::new(None),
            mux: Mux::new(),
            stats: Arc::new(TrafficStats::default()),
            disc_tx,
            disc_rx: Mutex::new(Some(disc_rx)),
            proto_err_tx,
            proto_err_rx: Mutex::new(Some(proto_err_rx)),
            closed_tx,
            closed_rx,
            activity_tx: Mutex::new(Some(activity_tx)),
            activity_rx,
        })
    }

    /// The remote end of the connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The local end of the connection, when the transport has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The address we dialed, if this is an outbound connection.
    pub fn dial_addr(&self) -> Option<&PeerAddress> {
        self.dial_addr.as_ref()
    }

    /// Whether we initiated this connection.
    pub fn is_outbound(&self) -> bool {
        self.dial_addr.is_some()
    }

    /// The remote identity, once the hello exchange has completed.
    pub fn identity(&self) -> Option<PublicKey> {
        self.info.lock().unwrap().as_ref().map(|i| i.identity.clone())
    }

    /// The remote capabilities, once the hello exchange has completed.
    pub fn caps(&self) -> Vec<Capability> {
        self.info
            .lock()
            .unwrap()
            .as_ref()
            .map(|i| i.caps.clone())
            .unwrap_or_default()
    }

    /// The complete handshake info, once published.
    pub fn handshake_info(&self) -> Option<HandshakeInfo> {
        self.info.lock().unwrap().clone()
    }

    /// The best known remote key: the handshake identity first, then the
    /// dialed address, then the advertised listen address.
    pub fn public_key(&self) -> Option<PublicKey> {
        let info = self.info.lock().unwrap();
        if let Some(info) = info.as_ref() {
            return Some(info.identity.clone());
        }
        if let Some(key) = self.dial_addr.as_ref().and_then(|a| a.pubkey.clone()) {
            return Some(key);
        }
        info.as_ref()
            .and_then(|i| i.listen_addr.as_ref())
            .and_then(|a| a.pubkey.clone())
    }

    /// The session token derived by the encrypted handshake, if any.
    pub fn session_token(&self) -> Option<[u8; 32]> {
        self.secure.lock().unwrap().as_ref().map(|s| s.token)
    }

    /// Traffic counters for this connection.
    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the peer has fully torn down.
    ///
    /// The closed signal is a level, not an edge: it can be awaited any
    /// number of times, before or after teardown.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the peer has fully torn down.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Request a disconnect with the given reason.
    ///
    /// Returns immediately. Idempotent: the first reason wins and requests
    /// against an already-closing peer are dropped.
    pub fn disconnect(&self, reason: DiscReason) {
        let _ = self.disc_tx.try_send(reason);
    }

    pub(crate) fn hooks(&self) -> &ServerHooks {
        &self.hooks
    }

    pub(crate) fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub(crate) fn activity_watch(&self) -> watch::Receiver<Instant> {
        self.activity_rx.clone()
    }

    pub(crate) fn local_caps(&self) -> Vec<Capability> {
        self.protocols.iter().map(|p| p.capability()).collect()
    }

    pub(crate) fn authenticated_identity(&self) -> Option<PublicKey> {
        self.secure.lock().unwrap().as_ref().map(|s| s.identity.clone())
    }

    pub(crate) fn set_handshake_info(&self, info: HandshakeInfo) {
        *self.info.lock().unwrap() = Some(info);
    }

    /// Drive the connection to completion.
    ///
    /// Returns the terminal disconnect reason and the underlying error, if
    /// there was one. The socket is closed and every task joined by the
    /// time this returns.
    pub async fn run(self: Arc<Self>) -> (DiscReason, Option<PeerError>) {
        let conn = self
            .conn
            .lock()
            .unwrap()
            .take()
            .expect("peer connection already consumed");
        let initiator = self.dial_addr.is_some();
        let expected = self.dial_addr.as_ref().and_then(|a| a.pubkey.clone());

        let established = timeout(
            self.config.handshake_timeout,
            secure::establish(
                conn,
                self.config.encrypted,
                self.hooks.identity(),
                expected.as_ref(),
                initiator,
            ),
        )
        .await;
        let channel = match established {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => {
                // The channel may not be trustworthy: no goodbye frame.
                tracing::info!(peer = %self, error = %err, "crypto handshake failed");
                return self.finish(DiscReason::ProtocolError, Some(err), None, false).await;
            }
            Err(_) => {
                let err = PeerError::Handshake("handshake timed out".into());
                tracing::info!(peer = %self, error = %err, "crypto handshake failed");
                return self.finish(DiscReason::ProtocolError, Some(err), None, false).await;
            }
        };

        if let (Some(token), Some(identity)) = (channel.session_token, channel.remote_identity.clone()) {
            *self.secure.lock().unwrap() = Some(SecureInfo { token, identity });
            tracing::info!(peer = %self, "secure connection using AES-256-CTR with HMAC-SHA256");
        } else {
            tracing::info!(peer = %self, "insecure connection using no encryption or authentication");
        }

        let limits = FrameLimits {
            whole_payload_size: self.config.whole_payload_size,
            max_message_size: self.config.max_message_size,
        };
        let mut messenger = Messenger::spawn(channel.reader, channel.writer, limits, self.stats.clone());
        *self.writer.lock().unwrap() = Some(messenger.writer());

        // Permission for the first frame.
        let read_next = messenger.read_next.clone();
        let _ = read_next.send(()).await;

        self.start_proto(
            BASE_PROTO_NAME,
            0,
            BASE_PROTOCOL_LENGTH,
            Arc::new(BaseProtocol::new()),
        );

        let (proto_done_tx, mut proto_done_rx) = mpsc::channel::<()>(1);
        let mut disc_rx = self
            .disc_rx
            .lock()
            .unwrap()
            .take()
            .expect("peer already started");
        let mut proto_err_rx = self
            .proto_err_rx
            .lock()
            .unwrap()
            .take()
            .expect("peer already started");

        let (reason, err, goodbye) = loop {
            tokio::select! {
                maybe_msg = messenger.inbound.recv() => match maybe_msg {
                    Some(msg) => {
                        let is_ping = msg.code == PING_MSG;
                        match self.dispatch(msg, &proto_done_tx).await {
                            Ok(wait) => {
                                if !wait {
                                    // Payload already buffered: read ahead.
                                    let _ = read_next.send(()).await;
                                }
                                if !is_ping {
                                    self.post_activity();
                                }
                            }
                            Err(err) => {
                                tracing::debug!(peer = %self, error = %err, "message dispatch failed");
                                break (disc_reason_for_error(&err), Some(err), true);
                            }
                        }
                    }
                    None => {
                        let err = messenger.errors.try_recv().unwrap_or_else(|_| {
                            PeerError::Network(std::io::Error::new(
                                std::io::ErrorKind::ConnectionAborted,
                                "connection closed",
                            ))
                        });
                        break (DiscReason::NetworkError, Some(err), false);
                    }
                },
                Some(()) = proto_done_rx.recv() => {
                    // A streamed payload finished draining; the socket may
                    // advance to the next frame.
                    let _ = read_next.send(()).await;
                },
                Some(err) = messenger.errors.recv() => {
                    // The connection is probably dead; skip the polite
                    // disconnect sequence.
                    break (DiscReason::NetworkError, Some(err), false);
                },
                Some(err) = proto_err_rx.recv() => {
                    break (disc_reason_for_error(&err), Some(err), true);
                },
                Some(reason) = disc_rx.recv() => {
                    break (reason, None, true);
                },
            }
        };

        self.finish(reason, err, Some(messenger), goodbye).await
    }

    /// Route one inbound message to the protocol owning its code window.
    ///
    /// Returns whether the caller must wait for the payload-done signal
    /// before issuing the next read-permission token.
    async fn dispatch(&self, mut msg: Msg, proto_done: &mpsc::Sender<()>) -> P2pResult<bool> {
        let (offset, in_tx) = self
            .mux
            .find_by_code(msg.code)
            .ok_or(PeerError::InvalidMsgCode(msg.code))?;
        msg.code -= offset;

        let wait = match &mut msg.payload {
            Payload::Full(_) => false,
            Payload::Streaming(reader) => {
                reader.set_done_signal(proto_done.clone());
                true
            }
        };

        if in_tx.send(msg).await.is_err() {
            // The protocol stopped; its error is already in flight. Dropping
            // a streamed payload here still fires the done signal.
            tracing::debug!(peer = %self, "dropping message for stopped protocol");
        }
        Ok(wait)
    }

    /// Start the negotiated subprotocols for the remote capability set.
    ///
    /// Windows are assigned contiguously above the base window, in
    /// canonical capability order over the intersection of both sides'
    /// advertisements. Allocation is append-only.
    pub(crate) fn start_subprotocols(self: &Arc<Self>, remote_caps: &[Capability]) {
        let chosen = negotiate(&self.local_caps(), remote_caps);
        tracing::debug!(
            peer = %self,
            caps = %chosen.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
            "starting subprotocols"
        );

        let mut offset = self.mux.next_offset(BASE_PROTOCOL_LENGTH);
        for cap in chosen {
            if let Some(proto) = self.protocols.iter().find(|p| p.capability() == cap) {
                let span = proto.code_span();
                self.start_proto(&cap.name, offset, span, proto.clone());
                offset += span;
            }
        }
    }

    fn start_proto(self: &Arc<Self>, name: &str, offset: u64, span: u64, proto: Arc<dyn Subprotocol>) {
        let Some(out) = self.writer.lock().unwrap().clone() else {
            return;
        };
        let (in_tx, in_rx) = mpsc::channel(1);
        if !self.mux.register(name, offset, span, in_tx) {
            return;
        }
        let link = ProtoChannel::new(in_rx, ProtoWriter::new(name.to_string(), offset, span, out));
        tracing::debug!(peer = %self, proto = name, offset, span, "protocol started");

        let peer = self.clone();
        let err_tx = self.proto_err_tx.clone();
        let label = name.to_string();
        self.mux.spawn(async move {
            let err = match proto.run(peer.clone(), link).await {
                // Protocols run for the life of the connection; an early
                // clean return still takes the peer down.
                Ok(()) => PeerError::Misc(format!("protocol {} exited", label)),
                Err(err) => {
                    tracing::debug!(peer = %peer, proto = %label, error = %err, "protocol error");
                    err
                }
            };
            // First failing protocol wins; after teardown nobody listens.
            let _ = err_tx.try_send(err);
        });
    }

    /// Send a message on behalf of a named running protocol, rebasing its
    /// protocol-local code into the protocol's window.
    pub async fn write_proto_msg(&self, proto_name: &str, mut msg: Msg) -> P2pResult<()> {
        let (offset, span) = self
            .mux
            .window_of(proto_name)
            .ok_or_else(|| PeerError::Misc(format!("protocol {} is not running", proto_name)))?;
        if msg.code >= span {
            return Err(PeerError::InvalidMsgCode(msg.code));
        }
        msg.code += offset;

        let writer = self
            .writer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PeerError::Misc("peer is not running".into()))?;
        writer.send(msg).await
    }

    fn post_activity(&self) {
        if let Some(tx) = self.activity_tx.lock().unwrap().as_ref() {
            tx.send_replace(Instant::now());
        }
    }

    async fn finish(
        &self,
        reason: DiscReason,
        err: Option<PeerError>,
        messenger: Option<Messenger>,
        goodbye: bool,
    ) -> (DiscReason, Option<PeerError>) {
        if goodbye {
            // Tell the remote end why, then give it time to read the reason.
            let writer = self.writer.lock().unwrap().clone();
            if let (Some(writer), Ok(msg)) = (
                writer,
                Msg::encode(DISCONNECT_MSG, &DisconnectMessage { reason }),
            ) {
                // Bounded so a wedged write queue cannot stall teardown.
                let _ = timeout(self.config.disconnect_grace_period, writer.send(msg)).await;
            }
            tokio::time::sleep(self.config.disconnect_grace_period).await;
        }

        // Teardown order matters: stop the activity bus, close every
        // subprotocol queue exactly once and join the tasks, fire the
        // closed broadcast, then drop the socket and framer.
        self.activity_tx.lock().unwrap().take();
        self.mux.close_all();
        self.mux.join_all().await;
        let _ = self.closed_tx.send(true);
        *self.writer.lock().unwrap() = None;
        if let Some(messenger) = messenger {
            messenger.shutdown().await;
        }

        match &err {
            Some(e) => tracing::info!(peer = %self, reason = %reason, error = %e, "peer closed"),
            None => tracing::info!(peer = %self, reason = %reason, "peer closed"),
        }
        (reason, err)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.dial_addr.is_some() {
            "outbound"
        } else {
            "inbound"
        };
        write!(f, "{} ({})", self.remote_addr, kind)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.dial_addr.is_some())
            .field("info", &self.handshake_info())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{ClientIdentity, KeyPair};

    fn test_peer() -> Arc<Peer> {
        let (conn, _other) = tokio::io::duplex(1024);
        Peer::new(
            conn,
            "127.0.0.1:30303".parse().unwrap(),
            None,
            None,
            Vec::new(),
            ServerHooks::new(ClientIdentity::generate("weft/test")),
            PeerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_disconnect_first_reason_wins() {
        let peer = test_peer();
        peer.disconnect(DiscReason::UselessPeer);
        peer.disconnect(DiscReason::TooManyPeers);

        let mut rx = peer.disc_rx.lock().unwrap().take().unwrap();
        assert_eq!(rx.try_recv().unwrap(), DiscReason::UselessPeer);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_info_published_atomically() {
        let peer = test_peer();
        assert!(peer.identity().is_none());
        assert!(peer.caps().is_empty());
        assert!(peer.handshake_info().is_none());

        let key = KeyPair::generate().public_key();
        peer.set_handshake_info(HandshakeInfo {
            identity: key.clone(),
            client_id: "weft/remote".into(),
            listen_addr: None,
            caps: vec![Capability::new("eth", 63)],
        });

        let info = peer.handshake_info().unwrap();
        assert_eq!(info.identity, key);
        assert_eq!(info.client_id, "weft/remote");
        assert_eq!(peer.caps(), vec![Capability::new("eth", 63)]);
        assert_eq!(peer.public_key(), Some(key));
    }

    #[tokio::test]
    async fn test_public_key_falls_back_to_dial_addr() {
        let key = KeyPair::generate().public_key();
        let (conn, _other) = tokio::io::duplex(1024);
        let peer = Peer::new(
            conn,
            "127.0.0.1:30303".parse().unwrap(),
            None,
            Some(PeerAddress::new(
                "127.0.0.1".parse().unwrap(),
                30303,
                Some(key.clone()),
            )),
            Vec::new(),
            ServerHooks::new(ClientIdentity::generate("weft/test")),
            PeerConfig::default(),
        );

        assert!(peer.is_outbound());
        assert_eq!(peer.public_key(), Some(key));
    }

    #[test]
    fn test_display_shows_direction() {
        let (conn, _other) = tokio::io::duplex(64);
        let peer = Peer::new(
            conn,
            "10.0.0.5:30303".parse().unwrap(),
            None,
            None,
            Vec::new(),
            ServerHooks::new(ClientIdentity::generate("weft/test")),
            PeerConfig::default(),
        );
        assert_eq!(peer.to_string(), "10.0.0.5:30303 (inbound)");
    }

    #[test]
    fn test_connection_addresses() {
        let (conn, _other) = tokio::io::duplex(64);
        let peer = Peer::new(
            conn,
            "10.0.0.5:30303".parse().unwrap(),
            Some("10.0.0.6:41000".parse().unwrap()),
            None,
            Vec::new(),
            ServerHooks::new(ClientIdentity::generate("weft/test")),
            PeerConfig::default(),
        );
        assert_eq!(peer.remote_addr(), "10.0.0.5:30303".parse().unwrap());
        assert_eq!(peer.local_addr(), Some("10.0.0.6:41000".parse().unwrap()));
    }
}
