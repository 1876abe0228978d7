//! Encrypted channel handshake and record layer.
//!
//! When encryption is enabled, the two ends run a one-round-trip handshake
//! before any frame is exchanged: each side sends its Ed25519 identity key,
//! an ephemeral X25519 key, and a 32-byte random nonce, signed by the
//! identity key. The side that dialed is the initiator and speaks first.
//!
//! The session token is SHA-256 over both nonces; HKDF-SHA256 keyed by the
//! X25519 shared secret (salted with the token) derives an AES-256-CTR key,
//! CTR IV, and HMAC-SHA256 key per direction.
//!
//! Frames then ride on an authenticated record layer: each record is a
//! 2-byte length, the CTR ciphertext, and an HMAC-SHA256 tag over the record
//! sequence number, length, and ciphertext. The record layer presents plain
//! `AsyncRead`/`AsyncWrite` halves, so the framer is identical in both
//! modes. A record that fails authentication kills the connection.

use std::io;

use aes::Aes256;
use bytes::{Buf, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use x25519_dalek::EphemeralSecret;

use weft_core::{ClientIdentity, PublicKey, Signature};

use crate::error::{P2pResult, PeerError};
use crate::framing::{ConnReader, ConnWriter};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Wire size of one auth hello: type + version + identity + ephemeral +
/// nonce + signature.
const AUTH_HELLO_LEN: usize = 2 + 32 + 32 + 32 + 64;

const AUTH_HELLO_TYPE: u8 = 0x01;
const AUTH_HELLO_VERSION: u8 = 1;

/// Domain separator for auth hello signatures.
const AUTH_SIGN_CONTEXT: &[u8] = b"weft-auth-v1";

/// HKDF info label for the record key schedule.
const KEY_SCHEDULE_INFO: &[u8] = b"weft-record-keys-v1";

/// Plaintext carried by a single record.
const MAX_RECORD_DATA: usize = 16 * 1024;

const MAC_LEN: usize = 32;

/// An established channel: stream halves ready for the framer, plus what
/// the handshake learned.
pub struct SecureChannel {
    /// Read half (decrypting, in encrypted mode).
    pub reader: ConnReader,
    /// Write half (encrypting, in encrypted mode).
    pub writer: ConnWriter,
    /// The remote identity authenticated by the handshake. `None` in
    /// plaintext mode.
    pub remote_identity: Option<PublicKey>,
    /// The derived session token. `None` in plaintext mode.
    pub session_token: Option<[u8; 32]>,
}

/// Run the channel setup over a fresh connection.
///
/// In plaintext mode this just splits the stream. In encrypted mode it runs
/// the handshake and wraps both halves in the record layer; `expected_remote`
/// (known when dialing by pubkey) is enforced against the authenticated
/// identity.
pub async fn establish<S>(
    stream: S,
    encrypted: bool,
    identity: &ClientIdentity,
    expected_remote: Option<&PublicKey>,
    initiator: bool,
) -> P2pResult<SecureChannel>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    if !encrypted {
        return Ok(SecureChannel {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
            remote_identity: None,
            session_token: None,
        });
    }

    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_public = x25519_dalek::PublicKey::from(&eph_secret);
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);

    let our_hello = encode_auth_hello(identity, eph_public.as_bytes(), &nonce);

    // The initiator speaks first; the responder answers only after it has
    // seen a well-formed hello.
    let mut remote_hello = [0u8; AUTH_HELLO_LEN];
    if initiator {
        write_half.write_all(&our_hello).await?;
        write_half.flush().await?;
        read_half.read_exact(&mut remote_hello).await?;
    } else {
        read_half.read_exact(&mut remote_hello).await?;
        write_half.write_all(&our_hello).await?;
        write_half.flush().await?;
    }

    let remote = decode_auth_hello(&remote_hello)?;
    if let Some(expected) = expected_remote {
        if remote.identity != *expected {
            return Err(PeerError::Handshake(format!(
                "remote identity {} does not match dialed key {}",
                remote.identity, expected
            )));
        }
    }

    let shared = eph_secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote.ephemeral));
    if !shared.was_contributory() {
        return Err(PeerError::Handshake("degenerate key exchange".into()));
    }

    let (init_nonce, resp_nonce) = if initiator {
        (nonce, remote.nonce)
    } else {
        (remote.nonce, nonce)
    };
    let token = session_token(&init_nonce, &resp_nonce);
    let schedule = KeySchedule::derive(shared.as_bytes(), &token)?;

    let (send, recv) = if initiator {
        (schedule.initiator, schedule.responder)
    } else {
        (schedule.responder, schedule.initiator)
    };

    let reader = StreamReader::new(FramedRead::new(read_half, RecordCodec::new(&recv)));
    let writer = SinkWriter::new(CopyToBytes::new(FramedWrite::new(
        write_half,
        RecordCodec::new(&send),
    )));

    tracing::debug!(remote = %remote.identity, initiator, "secure channel established");

    Ok(SecureChannel {
        reader: Box::new(reader),
        writer: Box::new(writer),
        remote_identity: Some(remote.identity),
        session_token: Some(token),
    })
}

struct AuthHello {
    identity: PublicKey,
    ephemeral: [u8; 32],
    nonce: [u8; 32],
}

fn auth_sign_data(identity: &[u8; 32], ephemeral: &[u8; 32], nonce: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(AUTH_SIGN_CONTEXT.len() + 96);
    data.extend_from_slice(AUTH_SIGN_CONTEXT);
    data.extend_from_slice(identity);
    data.extend_from_slice(ephemeral);
    data.extend_from_slice(nonce);
    data
}

fn encode_auth_hello(
    identity: &ClientIdentity,
    ephemeral: &[u8; 32],
    nonce: &[u8; 32],
) -> [u8; AUTH_HELLO_LEN] {
    let pubkey = identity.public_key();
    let signature = identity.sign(&auth_sign_data(pubkey.as_bytes(), ephemeral, nonce));

    let mut out = [0u8; AUTH_HELLO_LEN];
    out[0] = AUTH_HELLO_TYPE;
    out[1] = AUTH_HELLO_VERSION;
    out[2..34].copy_from_slice(pubkey.as_bytes());
    out[34..66].copy_from_slice(ephemeral);
    out[66..98].copy_from_slice(nonce);
    out[98..162].copy_from_slice(&signature.to_bytes());
    out
}

fn decode_auth_hello(buf: &[u8; AUTH_HELLO_LEN]) -> P2pResult<AuthHello> {
    if buf[0] != AUTH_HELLO_TYPE {
        return Err(PeerError::Handshake(format!(
            "unexpected handshake message type {:#04x}",
            buf[0]
        )));
    }
    if buf[1] != AUTH_HELLO_VERSION {
        return Err(PeerError::Handshake(format!(
            "unsupported handshake version {}",
            buf[1]
        )));
    }

    let mut identity_bytes = [0u8; 32];
    identity_bytes.copy_from_slice(&buf[2..34]);
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&buf[34..66]);
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&buf[66..98]);
    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(&buf[98..162]);

    let identity = PublicKey::from_bytes(&identity_bytes)
        .map_err(|_| PeerError::Handshake("invalid identity key".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    identity
        .verify(
            &auth_sign_data(&identity_bytes, &ephemeral, &nonce),
            &signature,
        )
        .map_err(|_| PeerError::Handshake("handshake signature verification failed".into()))?;

    Ok(AuthHello {
        identity,
        ephemeral,
        nonce,
    })
}

fn session_token(init_nonce: &[u8; 32], resp_nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(init_nonce);
    hasher.update(resp_nonce);
    hasher.finalize().into()
}

/// One direction's keying material.
struct DirectionKeys {
    enc_key: [u8; 32],
    iv: [u8; 16],
    mac_key: [u8; 32],
}

struct KeySchedule {
    initiator: DirectionKeys,
    responder: DirectionKeys,
}

impl KeySchedule {
    fn derive(shared: &[u8; 32], token: &[u8; 32]) -> P2pResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(token), shared);
        let mut okm = [0u8; 160];
        hk.expand(KEY_SCHEDULE_INFO, &mut okm)
            .map_err(|_| PeerError::Handshake("key schedule expansion failed".into()))?;

        fn direction(okm: &[u8]) -> DirectionKeys {
            let mut keys = DirectionKeys {
                enc_key: [0u8; 32],
                iv: [0u8; 16],
                mac_key: [0u8; 32],
            };
            keys.enc_key.copy_from_slice(&okm[0..32]);
            keys.iv.copy_from_slice(&okm[32..48]);
            keys.mac_key.copy_from_slice(&okm[48..80]);
            keys
        }

        Ok(Self {
            initiator: direction(&okm[0..80]),
            responder: direction(&okm[80..160]),
        })
    }
}

/// Codec for one direction of the record layer.
///
/// A single instance is used either purely as an encoder or purely as a
/// decoder; the CTR keystream and record sequence run continuously across
/// records in that direction.
struct RecordCodec {
    cipher: Aes256Ctr,
    mac_key: [u8; 32],
    seq: u64,
}

impl RecordCodec {
    fn new(keys: &DirectionKeys) -> Self {
        Self {
            cipher: Aes256Ctr::new((&keys.enc_key).into(), (&keys.iv).into()),
            mac_key: keys.mac_key,
            seq: 0,
        }
    }

    fn record_mac(&self, len: u16, ciphertext: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(&self.seq.to_be_bytes());
        mac.update(&len.to_be_bytes());
        mac.update(ciphertext);
        mac
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        for chunk in item.chunks(MAX_RECORD_DATA) {
            let mut ciphertext = chunk.to_vec();
            self.cipher.apply_keystream(&mut ciphertext);
            let tag = self
                .record_mac(ciphertext.len() as u16, &ciphertext)
                .finalize()
                .into_bytes();
            self.seq = self.seq.wrapping_add(1);

            dst.reserve(2 + ciphertext.len() + MAC_LEN);
            dst.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
            dst.extend_from_slice(&ciphertext);
            dst.extend_from_slice(&tag);
        }
        Ok(())
    }
}

impl Decoder for RecordCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty record"));
        }
        if src.len() < 2 + len + MAC_LEN {
            src.reserve(2 + len + MAC_LEN - src.len());
            return Ok(None);
        }

        src.advance(2);
        let mut ciphertext = src.split_to(len);
        let tag = src.split_to(MAC_LEN);

        // Authenticate before decrypting.
        self.record_mac(len as u16, &ciphertext)
            .verify_slice(&tag)
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "record authentication failed")
            })?;
        self.seq = self.seq.wrapping_add(1);
        self.cipher.apply_keystream(&mut ciphertext);

        Ok(Some(ciphertext.freeze()))
    }
}
