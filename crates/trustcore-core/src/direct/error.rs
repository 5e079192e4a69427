//! Error types for pairwise sessions

use thiserror::Error;
use trustcore_crypto::{AgreementPublicKey, CryptoError};

use crate::{
    codec::CodecError, ids::UserId, ratchet::RatchetError, store::StoreError,
    transport::TransportError,
};

/// Errors from pairwise encryption and decryption
#[derive(Debug, Error)]
pub enum DirectSessionError {
    /// A sender or recipient binding field is absent from the plaintext
    #[error("plaintext is missing binding field `{field}`")]
    MissingBinding {
        /// Name of the absent field
        field: &'static str,
    },

    /// Plaintext names a different recipient than this device
    #[error("message is bound to a different recipient ({field})")]
    RecipientMismatch {
        /// Field that did not match
        field: &'static str,
    },

    /// Plaintext sender claims do not match the device owning the key
    #[error("sender claims do not match the sending device ({field})")]
    SenderMismatch {
        /// Field that did not match
        field: &'static str,
    },

    /// No known device of the sender owns the envelope's identity key
    #[error("no device of {user_id} owns identity key {identity_key}")]
    UnknownSender {
        /// Claimed sending user
        user_id: UserId,
        /// Identity key in the envelope
        identity_key: AgreementPublicKey,
    },

    /// Pre-key message names a one-time key we do not hold
    #[error("unknown or already used one-time key")]
    UnknownOneTimeKey,

    /// Normal message for a session we never established
    #[error("unknown pairwise session {0}")]
    UnknownSession(String),

    /// Pre-key session id does not match its key material
    #[error("session id does not match pre-key material")]
    SessionIdMismatch,

    /// Ratchet could not reach the message index (replay or gap)
    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// Key agreement, signature or AEAD failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Envelope or plaintext encoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Delivery failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DirectSessionError {
    /// Returns true if resending the same content may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_transient(),
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the message was forged, replayed or misdirected.
    pub fn is_tamper(&self) -> bool {
        match self {
            Self::MissingBinding { .. }
            | Self::RecipientMismatch { .. }
            | Self::SenderMismatch { .. }
            | Self::SessionIdMismatch => true,
            Self::Crypto(err) => err.is_tamper(),
            Self::Ratchet(RatchetError::IndexPassed { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_failures_are_tamper() {
        assert!(DirectSessionError::MissingBinding { field: "recipient" }.is_tamper());
        assert!(DirectSessionError::SenderMismatch { field: "sender_device" }.is_tamper());
        assert!(!DirectSessionError::UnknownOneTimeKey.is_tamper());
    }

    #[test]
    fn only_transient_transport_errors_retry() {
        assert!(DirectSessionError::Transport(TransportError::Timeout).is_transient());
        assert!(!DirectSessionError::Transport(TransportError::Rejected("no".into())).is_transient());
        assert!(!DirectSessionError::UnknownSession("s".into()).is_transient());
    }
}
