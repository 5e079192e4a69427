//! CBOR encoding for wire payloads and stored records.
//!
//! Every payload that crosses a transport boundary (to-device content,
//! verification messages, backup session data) goes through these two
//! functions so size limits and error mapping live in one place.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Largest payload accepted for decoding (1 MiB).
///
/// Room key shares and verification messages are a few hundred bytes; the
/// limit only exists to bound parser work on hostile input.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// CBOR codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("CBOR encode failed: {0}")]
    Encode(String),

    /// Input was not a valid encoding of the expected type
    #[error("CBOR decode failed: {0}")]
    Decode(String),

    /// Input exceeded [`MAX_PAYLOAD_SIZE`]
    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}

/// Encode a value as CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR value, rejecting oversized input before parsing.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge { size: bytes.len(), max: MAX_PAYLOAD_SIZE });
    }
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
