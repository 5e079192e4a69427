//! Error types for group session operations

use thiserror::Error;
use trustcore_crypto::CryptoError;

use crate::{
    codec::CodecError,
    devices::DeviceKeyError,
    ids::{DeviceAddress, RoomId},
    ratchet::RatchetError,
    store::StoreError,
};

/// Errors from group session operations
#[derive(Debug, Error)]
pub enum GroupSessionError {
    /// No inbound session for the message
    #[error("no inbound session {session_id} in {room_id}")]
    MissingSession {
        /// Room of the message
        room_id: RoomId,
        /// Session the message claims
        session_id: String,
    },

    /// Message precedes the first index our copy of the session can decrypt
    #[error("message index {requested} precedes first known index {first_known}")]
    UnknownMessageIndex {
        /// First decryptable index
        first_known: u32,
        /// Index of the message
        requested: u32,
    },

    /// Key share from a device we blocked
    #[error("room key from blocked device {0}")]
    BlockedSender(DeviceAddress),

    /// Session data is internally inconsistent
    #[error("invalid session data: {0}")]
    InvalidSessionData(String),

    /// Ratchet could not reach the message index
    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// Signature or AEAD failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Device lookup failure
    #[error(transparent)]
    Device(#[from] DeviceKeyError),

    /// Payload encoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GroupSessionError {
    /// Returns true if this error is fatal for the message or call.
    ///
    /// Missing sessions and unknown indices can resolve once a key share,
    /// key request response or backup restore arrives.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::MissingSession { .. } | Self::UnknownMessageIndex { .. } => false,
            Self::Store(err) => !err.is_transient(),
            Self::BlockedSender(_)
            | Self::InvalidSessionData(_)
            | Self::Ratchet(_)
            | Self::Crypto(_)
            | Self::Device(_)
            | Self::Codec(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_session_is_recoverable() {
        let err = GroupSessionError::MissingSession {
            room_id: RoomId::from("!r:x"),
            session_id: "abc".into(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn tampering_is_fatal() {
        let err = GroupSessionError::Crypto(CryptoError::InvalidSignature);
        assert!(err.is_fatal());
    }
}
