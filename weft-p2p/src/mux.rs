//! Subprotocol multiplexer.
//!
//! Message codes are partitioned into windows: `[0, BASE_PROTOCOL_LENGTH)`
//! belongs to the base protocol, and each negotiated subprotocol gets the
//! next contiguous window in canonical capability order. The table maps a
//! running protocol to its window and inbound queue; it is written only
//! during startup and teardown, so reads take a read-mostly lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{P2pResult, PeerError};
use crate::framing::{Msg, MsgWriter};
use crate::peer::Peer;
use crate::protocol::Capability;

/// An application subprotocol hosted by the peer.
///
/// The peer spawns one task per running subprotocol. `run` owns the
/// protocol's inbound queue for the lifetime of the connection; the queue
/// closing means the peer is going away and must be treated as cancellation,
/// not as an error. Returning from `run` for any other reason disconnects
/// the peer.
#[async_trait]
pub trait Subprotocol: Send + Sync + 'static {
    /// The capability advertised for this protocol.
    fn capability(&self) -> Capability;

    /// Number of message codes the protocol uses. Its code window is
    /// `[offset, offset + code_span())` on the wire and
    /// `[0, code_span())` locally.
    fn code_span(&self) -> u64;

    /// Execute the protocol over its message channel.
    async fn run(&self, peer: Arc<Peer>, link: ProtoChannel) -> P2pResult<()>;
}

/// Message channel handed to a running subprotocol.
#[derive(Debug)]
pub struct ProtoChannel {
    rx: mpsc::Receiver<Msg>,
    writer: ProtoWriter,
}

impl ProtoChannel {
    pub(crate) fn new(rx: mpsc::Receiver<Msg>, writer: ProtoWriter) -> Self {
        Self { rx, writer }
    }

    /// Receive the next inbound message, already rebased to protocol-local
    /// codes. `None` means the peer is shutting down.
    pub async fn recv(&mut self) -> Option<Msg> {
        self.rx.recv().await
    }

    /// Send a message using a protocol-local code.
    pub async fn send(&self, code: u64, payload: Bytes) -> P2pResult<()> {
        self.writer.send(Msg::new(code, payload)).await
    }

    /// Get a clonable writer for this protocol's window.
    pub fn writer(&self) -> ProtoWriter {
        self.writer.clone()
    }
}

/// Shared writer bound to one protocol's code window.
///
/// Outgoing codes are protocol-local; the writer rebases them by adding the
/// window offset before handing the message to the framer.
#[derive(Debug, Clone)]
pub struct ProtoWriter {
    name: String,
    offset: u64,
    span: u64,
    out: MsgWriter,
}

impl ProtoWriter {
    pub(crate) fn new(name: String, offset: u64, span: u64, out: MsgWriter) -> Self {
        Self {
            name,
            offset,
            span,
            out,
        }
    }

    /// Send a message with a protocol-local code.
    pub async fn send(&self, mut msg: Msg) -> P2pResult<()> {
        if msg.code >= self.span {
            return Err(PeerError::InvalidMsgCode(msg.code));
        }
        msg.code += self.offset;
        self.out.send(msg).await
    }

    /// The protocol name this writer belongs to.
    pub fn proto_name(&self) -> &str {
        &self.name
    }
}

/// One running protocol's table entry.
#[derive(Debug)]
pub(crate) struct RunningProto {
    pub offset: u64,
    pub span: u64,
    pub in_tx: mpsc::Sender<Msg>,
}

/// Table of running protocols plus their task handles.
#[derive(Debug, Default)]
pub(crate) struct Mux {
    table: RwLock<HashMap<String, RunningProto>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol's window. Returns false (and changes nothing) if
    /// the name is already registered.
    pub fn register(&self, name: &str, offset: u64, span: u64, in_tx: mpsc::Sender<Msg>) -> bool {
        let mut table = self.table.write().unwrap();
        if table.contains_key(name) {
            return false;
        }
        table.insert(
            name.to_string(),
            RunningProto {
                offset,
                span,
                in_tx,
            },
        );
        true
    }

    /// The first code above every allocated window.
    pub fn next_offset(&self, base: u64) -> u64 {
        let table = self.table.read().unwrap();
        table
            .values()
            .map(|p| p.offset + p.span)
            .fold(base, u64::max)
    }

    /// Find the protocol owning a wire code. Returns the window offset and
    /// the inbound queue.
    pub fn find_by_code(&self, code: u64) -> Option<(u64, mpsc::Sender<Msg>)> {
        let table = self.table.read().unwrap();
        table
            .values()
            .find(|p| code >= p.offset && code < p.offset + p.span)
            .map(|p| (p.offset, p.in_tx.clone()))
    }

    /// Look up a protocol's window by name.
    pub fn window_of(&self, name: &str) -> Option<(u64, u64)> {
        let table = self.table.read().unwrap();
        table.get(name).map(|p| (p.offset, p.span))
    }

    /// Track a protocol task for teardown.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap().spawn(fut);
    }

    /// Close every inbound queue. Idempotent: queues are closed exactly
    /// once because the table is drained.
    pub fn close_all(&self) {
        self.table.write().unwrap().clear();
    }

    /// Wait for every protocol task to finish.
    pub async fn join_all(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<Msg> {
        mpsc::channel(1).0
    }

    #[test]
    fn test_register_and_find() {
        let mux = Mux::new();
        assert!(mux.register("p2p", 0, 16, sender()));
        assert!(mux.register("eth", 16, 8, sender()));

        assert_eq!(mux.find_by_code(0).map(|(o, _)| o), Some(0));
        assert_eq!(mux.find_by_code(15).map(|(o, _)| o), Some(0));
        assert_eq!(mux.find_by_code(16).map(|(o, _)| o), Some(16));
        assert_eq!(mux.find_by_code(23).map(|(o, _)| o), Some(16));
        assert!(mux.find_by_code(24).is_none());
    }

    #[test]
    fn test_duplicate_names_ignored() {
        let mux = Mux::new();
        assert!(mux.register("eth", 16, 8, sender()));
        assert!(!mux.register("eth", 24, 8, sender()));
        assert_eq!(mux.window_of("eth"), Some((16, 8)));
    }

    #[test]
    fn test_next_offset_is_append_only() {
        let mux = Mux::new();
        assert_eq!(mux.next_offset(16), 16);
        mux.register("p2p", 0, 16, sender());
        assert_eq!(mux.next_offset(16), 16);
        mux.register("eth", 16, 8, sender());
        assert_eq!(mux.next_offset(16), 24);
        mux.register("shh", 24, 5, sender());
        assert_eq!(mux.next_offset(16), 29);
    }

    #[test]
    fn test_close_all_drains_table() {
        let mux = Mux::new();
        mux.register("eth", 16, 8, sender());
        mux.close_all();
        assert!(mux.find_by_code(16).is_none());
        // A second close is a no-op.
        mux.close_all();
    }

    #[tokio::test]
    async fn test_writer_rebases_and_bounds_codes() {
        let (tx, mut rx) = mpsc::channel(4);
        let writer = ProtoWriter::new("eth".into(), 16, 8, MsgWriter::new(tx));

        writer.send(Msg::new(3, Bytes::new())).await.unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.code, 19);

        let err = writer.send(Msg::new(8, Bytes::new())).await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidMsgCode(8)));
    }
}
