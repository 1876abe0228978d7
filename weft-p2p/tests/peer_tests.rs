//! Acceptance tests for the peer connection core.
//!
//! These tests verify the core contracts end to end:
//! 1. Happy path - capability negotiation, one exchanged message, graceful
//!    disconnect with the reason observed on both sides
//! 2. Invalid code - out-of-window message disconnects with ProtocolError
//!    and a goodbye frame
//! 3. Large payload backpressure - streamed payloads arrive intact and in
//!    order with buffered ones
//! 4. Transport drop - NetworkError, no goodbye, bounded-time teardown
//! 5. Handshake failure - encrypted mode rejects an unexpected identity
//!    without a goodbye
//! 6. Ping timeout - a silent peer is disconnected with PingTimeout

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use weft_core::serialization::serialize;
use weft_core::ClientIdentity;
use weft_p2p::framing::put_uvarint;
use weft_p2p::{
    Capability, DiscReason, HelloMessage, P2pResult, Peer, PeerAddress, PeerConfig, PeerError,
    ProtoChannel, ServerHooks, Subprotocol, PROTOCOL_VERSION,
};

/// Event reported by a test protocol: (protocol label, local code, payload).
type ProtoEvent = (String, u64, Bytes);

/// A scriptable subprotocol: sends a fixed batch of messages when it starts,
/// then reports everything it receives.
struct TestProtocol {
    cap: Capability,
    span: u64,
    initial: Vec<(u64, Bytes)>,
    events: mpsc::UnboundedSender<ProtoEvent>,
    label: String,
}

impl TestProtocol {
    fn new(
        cap: Capability,
        span: u64,
        initial: Vec<(u64, Bytes)>,
        events: mpsc::UnboundedSender<ProtoEvent>,
    ) -> Arc<Self> {
        let label = cap.to_string();
        Arc::new(Self {
            cap,
            span,
            initial,
            events,
            label,
        })
    }
}

#[async_trait]
impl Subprotocol for TestProtocol {
    fn capability(&self) -> Capability {
        self.cap.clone()
    }

    fn code_span(&self) -> u64 {
        self.span
    }

    async fn run(&self, _peer: Arc<Peer>, mut link: ProtoChannel) -> P2pResult<()> {
        for (code, payload) in &self.initial {
            link.send(*code, payload.clone()).await?;
        }
        while let Some(mut msg) = link.recv().await {
            let payload = msg.payload.read_all().await?;
            let _ = self.events.send((self.label.clone(), msg.code, payload));
        }
        // Queue closed: the peer is shutting down.
        Ok(())
    }
}

fn test_config() -> PeerConfig {
    PeerConfig::new()
        .with_disconnect_grace_period(Duration::from_millis(100))
        .with_handshake_timeout(Duration::from_secs(2))
}

fn identity(name: &str) -> ClientIdentity {
    ClientIdentity::generate(format!("weft/0.1.0/{}", name))
}

fn spawn_peer(
    conn: DuplexStream,
    dial_addr: Option<PeerAddress>,
    protocols: Vec<Arc<dyn Subprotocol>>,
    hooks: ServerHooks,
    config: PeerConfig,
) -> (Arc<Peer>, JoinHandle<(DiscReason, Option<PeerError>)>) {
    let (remote, local) = if dial_addr.is_some() {
        ("127.0.0.1:30303", "127.0.0.1:51000")
    } else {
        ("127.0.0.1:45678", "127.0.0.1:52000")
    };
    let peer = Peer::new(
        conn,
        remote.parse().unwrap(),
        Some(local.parse().unwrap()),
        dial_addr,
        protocols,
        hooks,
        config,
    );
    let handle = tokio::spawn(peer.clone().run());
    (peer, handle)
}

fn dial(port: u16) -> Option<PeerAddress> {
    Some(PeerAddress::new("127.0.0.1".parse().unwrap(), port, None))
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProtoEvent>) -> ProtoEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for protocol event")
        .expect("event channel closed")
}

/// Write one raw frame, bypassing the peer machinery.
async fn write_frame(stream: &mut DuplexStream, code: u64, payload: &[u8]) {
    let mut buf = BytesMut::new();
    put_uvarint(&mut buf, code);
    put_uvarint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
}

fn raw_hello(id: &ClientIdentity, caps: Vec<Capability>) -> Vec<u8> {
    serialize(&HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        client_id: id.client_id().to_string(),
        caps,
        listen_port: 0,
        node_id: id.public_key(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_happy_path_negotiation_and_graceful_disconnect() {
    let (conn_a, conn_b) = tokio::io::duplex(256 * 1024);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    // A advertises only eth/63 and sends one message on it; B advertises
    // eth/63 and shh/2. The intersection is eth/63 alone.
    let eth_a = TestProtocol::new(
        Capability::new("eth", 63),
        8,
        vec![(3, Bytes::from_static(b"block announcement"))],
        sink_tx.clone(),
    );
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), events_tx.clone());
    let shh_b = TestProtocol::new(Capability::new("shh", 2), 5, Vec::new(), events_tx);

    let (peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a],
        ServerHooks::new(identity("a")),
        test_config(),
    );
    let (peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b, shh_b],
        ServerHooks::new(identity("b")),
        test_config(),
    );

    // B's eth instance sees A's message with its protocol-local code.
    let (label, code, payload) = next_event(&mut events_rx).await;
    assert_eq!(label, "eth/63");
    assert_eq!(code, 3);
    assert_eq!(payload, &b"block announcement"[..]);

    // Hello info is published on both sides.
    assert_eq!(peer_b.caps(), vec![Capability::new("eth", 63)]);
    assert!(peer_a
        .caps()
        .contains(&Capability::new("shh", 2)));

    peer_a.disconnect(DiscReason::ClientQuitting);

    let (reason_a, err_a) = handle_a.await.unwrap();
    assert_eq!(reason_a, DiscReason::ClientQuitting);
    assert!(err_a.is_none());

    // B observes the same reason A sent.
    let (reason_b, err_b) = handle_b.await.unwrap();
    assert_eq!(reason_b, DiscReason::ClientQuitting);
    assert!(matches!(
        err_b,
        Some(PeerError::Disconnected(DiscReason::ClientQuitting))
    ));

    // Both closed signals have fired and stay readable.
    peer_a.closed().await;
    peer_b.closed().await;
    assert!(peer_a.is_closed());
    assert!(peer_b.is_closed());
}

#[tokio::test]
async fn test_two_subprotocols_get_disjoint_windows() {
    let (conn_a, conn_b) = tokio::io::duplex(256 * 1024);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    // Both sides run eth/63 and shh/2; A's instances each write one message
    // concurrently. Frames must come out whole and land on the right
    // protocol with protocol-local codes.
    let eth_a = TestProtocol::new(
        Capability::new("eth", 63),
        8,
        vec![(7, Bytes::from(vec![0xeeu8; 20_000]))],
        sink_tx.clone(),
    );
    let shh_a = TestProtocol::new(
        Capability::new("shh", 2),
        5,
        vec![(4, Bytes::from(vec![0x55u8; 20_000]))],
        sink_tx.clone(),
    );
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), events_tx.clone());
    let shh_b = TestProtocol::new(Capability::new("shh", 2), 5, Vec::new(), events_tx);

    let (peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a, shh_a],
        ServerHooks::new(identity("a")),
        test_config(),
    );
    let (peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b, shh_b],
        ServerHooks::new(identity("b")),
        test_config(),
    );

    let mut seen = std::collections::HashMap::new();
    for _ in 0..2 {
        let (label, code, payload) = next_event(&mut events_rx).await;
        seen.insert(label, (code, payload));
    }
    let (eth_code, eth_payload) = &seen["eth/63"];
    assert_eq!(*eth_code, 7);
    assert!(eth_payload.iter().all(|&b| b == 0xee));
    let (shh_code, shh_payload) = &seen["shh/2"];
    assert_eq!(*shh_code, 4);
    assert!(shh_payload.iter().all(|&b| b == 0x55));

    assert!(peer_b.stats().messages_recv >= 3, "hello plus two messages");

    peer_a.disconnect(DiscReason::ClientQuitting);
    let _ = handle_a.await.unwrap();
    let _ = handle_b.await.unwrap();
}

#[tokio::test]
async fn test_invalid_code_disconnects_with_protocol_error() {
    let (conn_a, conn_b) = tokio::io::duplex(256 * 1024);
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    // A's eth claims a wider window than B's, so A can emit a code that
    // lands outside every window on B.
    let eth_a = TestProtocol::new(
        Capability::new("eth", 63),
        16,
        vec![(10, Bytes::from_static(b"out of range"))],
        sink_tx.clone(),
    );
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx);

    let (_peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a],
        ServerHooks::new(identity("a")),
        test_config(),
    );
    let (_peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b],
        ServerHooks::new(identity("b")),
        test_config(),
    );

    let (reason_b, err_b) = timeout(Duration::from_secs(5), handle_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason_b, DiscReason::ProtocolError);
    assert!(matches!(err_b, Some(PeerError::InvalidMsgCode(26))));

    // The goodbye frame reached A: it reports B's reason.
    let (reason_a, err_a) = timeout(Duration::from_secs(5), handle_a)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason_a, DiscReason::ProtocolError);
    assert!(matches!(
        err_a,
        Some(PeerError::Disconnected(DiscReason::ProtocolError))
    ));
}

#[tokio::test]
async fn test_large_payloads_stream_in_order() {
    let (conn_a, conn_b) = tokio::io::duplex(1024 * 1024);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    // B buffers payloads up to 64 bytes; everything bigger streams.
    let payloads: Vec<(u64, Bytes)> = vec![
        (0, Bytes::from(vec![1u8; 10])),
        (1, Bytes::from(vec![2u8; 640])),
        (2, Bytes::from(vec![3u8; 30])),
        (3, Bytes::from(vec![4u8; 100_000])),
        (4, Bytes::from(vec![5u8; 5])),
    ];
    let eth_a = TestProtocol::new(
        Capability::new("eth", 63),
        8,
        payloads.clone(),
        sink_tx,
    );
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), events_tx);

    let (_peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a],
        ServerHooks::new(identity("a")),
        test_config(),
    );
    let (_peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b],
        ServerHooks::new(identity("b")),
        test_config().with_whole_payload_size(64),
    );

    // The sequence observed by the subprotocol equals the wire sequence.
    for (code, payload) in &payloads {
        let (_, got_code, got_payload) = next_event(&mut events_rx).await;
        assert_eq!(got_code, *code);
        assert_eq!(&got_payload, payload);
    }

    _peer_a.disconnect(DiscReason::RequestedDisconnect);
    let _ = handle_a.await.unwrap();
    let _ = handle_b.await.unwrap();
}

#[tokio::test]
async fn test_transport_drop_terminates_without_goodbye() {
    let (conn_a, conn_b) = tokio::io::duplex(64 * 1024);
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx);
    let (_peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b],
        ServerHooks::new(identity("b")),
        test_config(),
    );

    // The remote socket dies before saying anything.
    drop(conn_a);

    // All tasks join within bounded time; the reason is NetworkError and no
    // goodbye frame was attempted.
    let (reason, err) = timeout(Duration::from_secs(2), handle_b)
        .await
        .expect("peer did not terminate in bounded time")
        .unwrap();
    assert_eq!(reason, DiscReason::NetworkError);
    assert!(matches!(err, Some(PeerError::Network(_))));
}

#[tokio::test]
async fn test_encrypted_handshake_rejects_unexpected_identity() {
    let (conn_a, conn_b) = tokio::io::duplex(64 * 1024);
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    // A dials expecting a key that is not B's identity.
    let stranger = identity("stranger").public_key();
    let dial_addr = Some(PeerAddress::new(
        "127.0.0.1".parse().unwrap(),
        45678,
        Some(stranger),
    ));

    let eth_a = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx.clone());
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx);

    let config = test_config()
        .with_encryption(true)
        .with_handshake_timeout(Duration::from_millis(500));
    let (_peer_a, handle_a) = spawn_peer(
        conn_a,
        dial_addr,
        vec![eth_a],
        ServerHooks::new(identity("a")),
        config.clone(),
    );
    let (_peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b],
        ServerHooks::new(identity("b")),
        config,
    );

    // A fails the handshake: ProtocolError, no goodbye.
    let (reason_a, err_a) = timeout(Duration::from_secs(5), handle_a)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason_a, DiscReason::ProtocolError);
    assert!(matches!(err_a, Some(PeerError::Handshake(_))));

    // B never gets a hello and gives up as well.
    let (reason_b, _err_b) = timeout(Duration::from_secs(5), handle_b)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        reason_b,
        DiscReason::ProtocolError | DiscReason::NetworkError
    ));
}

#[tokio::test]
async fn test_encrypted_happy_path() {
    let (conn_a, conn_b) = tokio::io::duplex(256 * 1024);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    let eth_a = TestProtocol::new(
        Capability::new("eth", 63),
        8,
        vec![(0, Bytes::from(vec![0x77u8; 40_000]))],
        sink_tx,
    );
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), events_tx);

    let config = test_config().with_encryption(true);
    let (peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a],
        ServerHooks::new(identity("a")),
        config.clone(),
    );
    let (peer_b, handle_b) = spawn_peer(
        conn_b,
        None,
        vec![eth_b],
        ServerHooks::new(identity("b")),
        config,
    );

    let (_, code, payload) = next_event(&mut events_rx).await;
    assert_eq!(code, 0);
    assert_eq!(payload.len(), 40_000);
    assert!(payload.iter().all(|&b| b == 0x77));

    // Both ends derived the same session token.
    let token_a = peer_a.session_token().expect("A has a session token");
    let token_b = peer_b.session_token().expect("B has a session token");
    assert_eq!(token_a, token_b);

    peer_b.disconnect(DiscReason::ClientQuitting);
    let (reason_b, _) = handle_b.await.unwrap();
    assert_eq!(reason_b, DiscReason::ClientQuitting);
    let (reason_a, _) = handle_a.await.unwrap();
    assert_eq!(reason_a, DiscReason::ClientQuitting);
}

#[tokio::test]
async fn test_verify_pubkey_rejection_disconnects() {
    let (conn_a, conn_b) = tokio::io::duplex(64 * 1024);
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    let eth_a = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx.clone());
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx);

    let (_peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a],
        ServerHooks::new(identity("a")),
        test_config(),
    );
    // B rejects every remote key.
    let hooks_b = ServerHooks::new(identity("b")).with_verify_pubkey(|addr| {
        Err(PeerError::breach(
            DiscReason::UnexpectedIdentity,
            format!("{} is not allowed", addr),
        ))
    });
    let (_peer_b, handle_b) = spawn_peer(conn_b, None, vec![eth_b], hooks_b, test_config());

    let (reason_b, err_b) = timeout(Duration::from_secs(5), handle_b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason_b, DiscReason::UnexpectedIdentity);
    assert!(matches!(
        err_b,
        Some(PeerError::Breach {
            reason: DiscReason::UnexpectedIdentity,
            ..
        })
    ));

    // B disconnected gracefully, so A learns the reason.
    let (reason_a, _) = timeout(Duration::from_secs(5), handle_a)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason_a, DiscReason::UnexpectedIdentity);
}

#[tokio::test]
async fn test_ping_timeout_disconnects_silent_peer() {
    let (conn_a, mut raw_b) = tokio::io::duplex(64 * 1024);
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();

    let eth_a = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx);
    let config = test_config().with_inactivity_timeout(Duration::from_millis(150));
    let (_peer_a, handle_a) = spawn_peer(
        conn_a,
        dial(45678),
        vec![eth_a],
        ServerHooks::new(identity("a")),
        config,
    );

    // The raw side sends a valid hello, then goes silent: it never answers
    // the keepalive ping.
    let hello = raw_hello(&identity("b"), vec![Capability::new("eth", 63)]);
    write_frame(&mut raw_b, 0, &hello).await;

    let (reason, err) = timeout(Duration::from_secs(5), handle_a)
        .await
        .expect("peer did not time out the silent remote")
        .unwrap();
    assert_eq!(reason, DiscReason::PingTimeout);
    assert!(matches!(err, Some(PeerError::PingTimeout)));
}

#[tokio::test]
async fn test_peers_gossip_reaches_announce_channel() {
    let (conn_a, conn_b) = tokio::io::duplex(64 * 1024);
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
    let (announce_tx, mut announce_rx) = mpsc::channel(16);

    let eth_a = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx.clone());
    let eth_b = TestProtocol::new(Capability::new("eth", 63), 8, Vec::new(), sink_tx);

    // A announces addresses it hears about; B serves its peer list.
    let hooks_a = ServerHooks::new(identity("a")).with_announce_channel(announce_tx);
    let gossiped = PeerAddress::new("198.51.100.7".parse().unwrap(), 30303, None);
    let summary_addr = gossiped.clone();
    let known = identity("known").public_key();
    let hooks_b = ServerHooks::new(identity("b")).with_other_peers(move || {
        vec![weft_p2p::PeerSummary {
            node_id: known.clone(),
            listen_addr: Some(summary_addr.clone()),
        }]
    });

    let (peer_a, handle_a) = spawn_peer(conn_a, dial(45678), vec![eth_a], hooks_a, test_config());
    let (_peer_b, handle_b) = spawn_peer(conn_b, None, vec![eth_b], hooks_b, test_config());

    // Wait for the hello exchange, then ask B for its peers.
    timeout(Duration::from_secs(5), async {
        while peer_a.identity().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    peer_a
        .write_proto_msg(
            "p2p",
            weft_p2p::Msg::new(weft_p2p::protocol::GET_PEERS_MSG, Bytes::new()),
        )
        .await
        .unwrap();

    let announced = timeout(Duration::from_secs(5), announce_rx.recv())
        .await
        .expect("no address announced")
        .unwrap();
    assert_eq!(announced, gossiped);

    peer_a.disconnect(DiscReason::RequestedDisconnect);
    let _ = handle_a.await.unwrap();
    let _ = handle_b.await.unwrap();
}
