//! Framed messenger.
//!
//! Turns a raw byte stream into a sequence of `(code, size, payload)`
//! messages. Frames are encoded as two unsigned LEB128 varints (code, then
//! payload size) followed by the payload bytes.
//!
//! The messenger runs two tasks over the split stream:
//!
//! - The reader task delivers exactly one message at a time and will not
//!   touch the socket again until it receives a read-permission token. Small
//!   payloads are buffered whole before delivery; larger ones are streamed
//!   through a bounded chunk channel so a slow consumer backpressures the
//!   socket instead of ballooning memory.
//! - The writer task drains a bounded queue of outbound messages, making
//!   each write atomic with respect to all other writers.
//!
//! The first fatal read or write error is published on the error channel;
//! after that the messenger is dead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{P2pResult, PeerError};

/// Boxed read half of a peer connection.
pub type ConnReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a peer connection.
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunk size used when streaming large payloads.
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// Queue depth for streamed payload chunks.
const STREAM_CHUNK_QUEUE: usize = 4;

/// Queue depth for outbound messages.
const WRITE_QUEUE: usize = 16;

/// Frame size limits, taken from the peer configuration.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Payloads at or below this size are buffered whole.
    pub whole_payload_size: u32,
    /// Payloads above this size are rejected.
    pub max_message_size: u32,
}

/// One protocol message.
///
/// `size` is the total payload length in bytes; the payload itself is either
/// fully buffered or streamed depending on that size.
#[derive(Debug)]
pub struct Msg {
    /// Message code. On the wire this includes the owning protocol's window
    /// offset; the dispatcher rebases it to protocol-local zero.
    pub code: u64,
    /// Total payload length in bytes.
    pub size: u32,
    /// The payload.
    pub payload: Payload,
}

impl Msg {
    /// Create an outbound message with a fully buffered payload.
    pub fn new(code: u64, payload: Bytes) -> Self {
        Self {
            code,
            size: payload.len() as u32,
            payload: Payload::Full(payload),
        }
    }

    /// Create an outbound message by serializing a value.
    pub fn encode<T: Serialize>(code: u64, value: &T) -> P2pResult<Self> {
        let bytes = weft_core::serialization::serialize(value)?;
        Ok(Msg::new(code, bytes.into()))
    }
}

/// A message payload: buffered whole, or streamed from the framer.
#[derive(Debug)]
pub enum Payload {
    /// The framer buffered the whole payload before delivery.
    Full(Bytes),
    /// The payload is streamed; the transport cannot advance to the next
    /// frame until this has been drained.
    Streaming(PayloadReader),
}

impl Payload {
    /// Whether the payload was buffered whole by the framer.
    pub fn is_buffered(&self) -> bool {
        matches!(self, Payload::Full(_))
    }

    /// Read the complete payload into memory.
    pub async fn read_all(&mut self) -> P2pResult<Bytes> {
        match self {
            Payload::Full(bytes) => Ok(bytes.clone()),
            Payload::Streaming(reader) => reader.read_to_end().await,
        }
    }
}

/// Streaming reader for a large payload.
///
/// Reports completion to the peer loop once exactly `size` bytes have been
/// consumed, or when the reader is dropped early (the framer then discards
/// the rest of the payload itself so the wire stays in sync).
#[derive(Debug)]
pub struct PayloadReader {
    rx: mpsc::Receiver<Bytes>,
    size: u32,
    consumed: u32,
    done: Option<mpsc::Sender<()>>,
    done_sent: bool,
}

impl PayloadReader {
    fn new(rx: mpsc::Receiver<Bytes>, size: u32) -> Self {
        Self {
            rx,
            size,
            consumed: 0,
            done: None,
            done_sent: false,
        }
    }

    /// Total payload size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether the full payload has been consumed.
    pub fn is_complete(&self) -> bool {
        self.consumed >= self.size
    }

    pub(crate) fn set_done_signal(&mut self, tx: mpsc::Sender<()>) {
        self.done = Some(tx);
    }

    /// Receive the next chunk of the payload.
    ///
    /// Returns `None` once the payload is complete, or early if the
    /// transport died mid-payload (check [`PayloadReader::is_complete`]).
    pub async fn chunk(&mut self) -> Option<Bytes> {
        if self.is_complete() {
            return None;
        }
        match self.rx.recv().await {
            Some(chunk) => {
                self.consumed = self.consumed.saturating_add(chunk.len() as u32);
                if self.is_complete() {
                    self.signal_done();
                }
                Some(chunk)
            }
            None => {
                // Producer went away before delivering the full payload.
                self.signal_done();
                None
            }
        }
    }

    /// Drain the full payload into a single buffer.
    pub async fn read_to_end(&mut self) -> P2pResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size as usize);
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk);
        }
        if !self.is_complete() {
            return Err(PeerError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "payload truncated",
            )));
        }
        Ok(buf.freeze())
    }

    /// Drain and drop the rest of the payload.
    pub async fn discard(&mut self) -> P2pResult<()> {
        while self.chunk().await.is_some() {}
        if !self.is_complete() {
            return Err(PeerError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "payload truncated",
            )));
        }
        Ok(())
    }

    fn signal_done(&mut self) {
        if !self.done_sent {
            self.done_sent = true;
            if let Some(tx) = &self.done {
                let _ = tx.try_send(());
            }
        }
    }
}

impl Drop for PayloadReader {
    fn drop(&mut self) {
        self.signal_done();
    }
}

/// Handle for writing messages; clonable, one per running protocol.
#[derive(Debug, Clone)]
pub struct MsgWriter {
    tx: mpsc::Sender<Msg>,
}

impl MsgWriter {
    pub(crate) fn new(tx: mpsc::Sender<Msg>) -> Self {
        Self { tx }
    }

    /// Queue a message for writing. The write itself happens on the writer
    /// task; write failures surface on the messenger error channel.
    pub async fn send(&self, msg: Msg) -> P2pResult<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PeerError::Misc("messenger closed".into()))
    }
}

/// Per-connection traffic counters.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    messages_recv: AtomicU64,
    messages_sent: AtomicU64,
}

impl TrafficStats {
    fn record_recv(&self, bytes: u64) {
        self.bytes_recv.fetch_add(bytes, Ordering::Relaxed);
        self.messages_recv.fetch_add(1, Ordering::Relaxed);
    }

    fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_recv: self.messages_recv.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`TrafficStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Payload bytes received.
    pub bytes_recv: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Messages received.
    pub messages_recv: u64,
    /// Messages sent.
    pub messages_sent: u64,
}

/// The framed messenger endpoints.
pub struct Messenger {
    /// Inbound messages, one at a time.
    pub inbound: mpsc::Receiver<Msg>,
    /// Read-permission tokens. The reader task will not read the next frame
    /// until a token arrives; the consumer must send one per frame.
    pub read_next: mpsc::Sender<()>,
    /// First fatal read or write error.
    pub errors: mpsc::Receiver<PeerError>,
    writer: MsgWriter,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Messenger {
    /// Spawn the reader and writer tasks over the split stream.
    pub fn spawn(
        reader: ConnReader,
        writer: ConnWriter,
        limits: FrameLimits,
        stats: Arc<TrafficStats>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (token_tx, token_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (error_tx, error_rx) = mpsc::channel(2);

        let reader_task = tokio::spawn(read_loop(
            reader,
            inbound_tx,
            token_rx,
            error_tx.clone(),
            limits,
            stats.clone(),
        ));
        let writer_task = tokio::spawn(write_loop(writer, write_rx, error_tx, stats));

        Self {
            inbound: inbound_rx,
            read_next: token_tx,
            errors: error_rx,
            writer: MsgWriter::new(write_tx),
            reader_task,
            writer_task,
        }
    }

    /// Get a clonable writer handle.
    pub fn writer(&self) -> MsgWriter {
        self.writer.clone()
    }

    /// Tear down the messenger, closing the underlying stream halves.
    pub async fn shutdown(self) {
        self.reader_task.abort();
        self.writer_task.abort();
        let _ = self.reader_task.await;
        let _ = self.writer_task.await;
    }
}

async fn read_loop(
    mut reader: ConnReader,
    inbound: mpsc::Sender<Msg>,
    mut tokens: mpsc::Receiver<()>,
    errors: mpsc::Sender<PeerError>,
    limits: FrameLimits,
    stats: Arc<TrafficStats>,
) {
    if let Err(err) = read_frames(&mut reader, &inbound, &mut tokens, limits, &stats).await {
        let _ = errors.try_send(err);
    }
}

async fn read_frames(
    reader: &mut ConnReader,
    inbound: &mpsc::Sender<Msg>,
    tokens: &mut mpsc::Receiver<()>,
    limits: FrameLimits,
    stats: &TrafficStats,
) -> P2pResult<()> {
    loop {
        // One frame per token: this is the single source of read permission.
        if tokens.recv().await.is_none() {
            return Ok(());
        }

        let code = read_uvarint(reader).await?;
        let size = read_uvarint(reader).await?;
        if size > limits.max_message_size as u64 {
            return Err(PeerError::Frame(format!(
                "payload of {} bytes exceeds limit of {}",
                size, limits.max_message_size
            )));
        }
        let size = size as u32;
        stats.record_recv(size as u64);

        if size <= limits.whole_payload_size {
            let mut buf = vec![0u8; size as usize];
            reader.read_exact(&mut buf).await?;
            let msg = Msg {
                code,
                size,
                payload: Payload::Full(buf.into()),
            };
            if inbound.send(msg).await.is_err() {
                return Ok(());
            }
        } else {
            let (chunk_tx, chunk_rx) = mpsc::channel(STREAM_CHUNK_QUEUE);
            let msg = Msg {
                code,
                size,
                payload: Payload::Streaming(PayloadReader::new(chunk_rx, size)),
            };
            if inbound.send(msg).await.is_err() {
                return Ok(());
            }

            let mut remaining = size as usize;
            let mut forwarding = true;
            while remaining > 0 {
                let mut chunk = BytesMut::with_capacity(remaining.min(STREAM_CHUNK_SIZE));
                let n = reader.read_buf(&mut chunk).await?;
                if n == 0 {
                    return Err(PeerError::Network(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-payload",
                    )));
                }
                remaining -= n;
                if forwarding && chunk_tx.send(chunk.freeze()).await.is_err() {
                    // Consumer gave up; keep draining so the wire stays in
                    // sync for the next frame.
                    forwarding = false;
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: ConnWriter,
    mut outbound: mpsc::Receiver<Msg>,
    errors: mpsc::Sender<PeerError>,
    stats: Arc<TrafficStats>,
) {
    while let Some(msg) = outbound.recv().await {
        let payload = match msg.payload {
            Payload::Full(bytes) => bytes,
            Payload::Streaming(_) => {
                let _ = errors.try_send(PeerError::InvalidMsg(
                    "streaming payloads cannot be written".into(),
                ));
                return;
            }
        };

        let mut header = BytesMut::with_capacity(20);
        put_uvarint(&mut header, msg.code);
        put_uvarint(&mut header, payload.len() as u64);

        let result = async {
            writer.write_all(&header).await?;
            writer.write_all(&payload).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => stats.record_sent(payload.len() as u64),
            Err(err) => {
                let _ = errors.try_send(PeerError::Network(err));
                return;
            }
        }
    }
}

/// Append an unsigned LEB128 varint to the buffer.
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint from the stream.
pub async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> P2pResult<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        let b = byte[0];
        if i == 9 && b > 1 {
            return Err(PeerError::Frame("varint overflows u64".into()));
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(PeerError::Frame("varint too long".into()))
}
