//! Core types shared across the Weft protocol stack.
//!
//! This crate intentionally stays small: it holds the pieces that both the
//! networking layer and embedders need to agree on.
//!
//! - Node identities (Ed25519 key pairs with raw-bytes serialization)
//! - Deterministic binary serialization for wire payloads
//! - Error types for the above

pub mod error;
pub mod identity;
pub mod serialization;

pub use error::{CoreError, CryptoError, SerializationError};
pub use identity::{ClientIdentity, KeyPair, PublicKey, Signature};
