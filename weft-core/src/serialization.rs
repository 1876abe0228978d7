//! Deterministic binary serialization for Weft wire payloads.
//!
//! Both ends of a connection must produce byte-identical encodings for the
//! same value, so the bincode configuration is pinned: fixed-size integer
//! encoding, little-endian byte order, and trailing bytes rejected on
//! deserialization.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SerializationError;

fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Serialize a value to bytes using the pinned configuration.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    config()
        .serialize(value)
        .map_err(|e| SerializationError::EncodeFailed(e.to_string()))
}

/// Deserialize a value from bytes.
///
/// Fails on malformed input, trailing bytes, or a type mismatch.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    config()
        .deserialize(bytes)
        .map_err(|e| SerializationError::DecodeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        code: u64,
        addr: Option<std::net::IpAddr>,
        tags: Vec<String>,
    }

    #[test]
    fn test_roundtrip() {
        let original = Sample {
            code: 7,
            addr: Some("10.1.2.3".parse().unwrap()),
            tags: vec!["eth".into(), "shh".into()],
        };

        let bytes = serialize(&original).unwrap();
        let recovered: Sample = deserialize(&bytes).unwrap();

        assert_eq!(original, recovered);
    }

    #[test]
    fn test_determinism() {
        let value = Sample {
            code: u64::MAX,
            addr: None,
            tags: Vec::new(),
        };

        assert_eq!(serialize(&value).unwrap(), serialize(&value).unwrap());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = serialize(&42u64).unwrap();
        bytes.push(0xFF);

        let result: Result<u64, _> = deserialize(&bytes);
        assert!(result.is_err());
    }
}
