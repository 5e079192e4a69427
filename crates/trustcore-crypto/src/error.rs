//! Error types for primitive operations

use thiserror::Error;

/// Errors from primitive cryptographic operations.
///
/// Every variant is fatal for the message or session it was raised for.
/// Callers must surface these rather than swallow them: a silent failure
/// here would mask tampering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD open failed (wrong key, wrong nonce, or tampered ciphertext)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// AEAD seal failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Signature did not verify against the public key
    #[error("signature verification failed")]
    InvalidSignature,

    /// Public key bytes do not encode a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key agreement produced an all-zero secret
    #[error("key agreement produced a non-contributory secret")]
    WeakKeyAgreement,

    /// KDF was asked for an output it cannot produce
    #[error("invalid KDF output length: {length}")]
    InvalidOutputLength {
        /// Requested output length
        length: usize,
    },

    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },
}

impl CryptoError {
    /// Returns true if this error indicates the input was forged or corrupted.
    ///
    /// Tamper errors must never be retried or downgraded.
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. } | Self::InvalidSignature)
    }
}
