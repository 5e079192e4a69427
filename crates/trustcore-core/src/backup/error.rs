//! Error types for key backup

use thiserror::Error;
use trustcore_crypto::CryptoError;

use super::state::BackupState;
use crate::{
    codec::CodecError, group::GroupSessionError, store::StoreError, transport::TransportError,
};

/// Errors from backup and recovery.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Server has no backup version
    #[error("no backup on the server")]
    NoBackup,

    /// Server backup uses an algorithm this crate cannot read
    #[error("unsupported backup algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// Text is not a valid recovery key
    #[error("invalid recovery key")]
    InvalidRecoveryKey,

    /// Key does not match the backup's public key
    #[error("key does not match the backup")]
    KeyMismatch,

    /// Backup key was not derived from a passphrase
    #[error("backup has no passphrase")]
    NoPassphrase,

    /// Uploads are not possible in this state
    #[error("backup is {0}")]
    NotEnabled(BackupState),

    /// Key agreement, KDF or AEAD failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Session payload encoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Importing restored sessions failed
    #[error(transparent)]
    Group(#[from] GroupSessionError),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Backup server failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BackupError {
    /// Retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_transport_failures_are_transient() {
        assert!(BackupError::Transport(TransportError::Timeout).is_transient());
        assert!(!BackupError::KeyMismatch.is_transient());
        assert!(!BackupError::NotEnabled(BackupState::Disabled).is_transient());
    }
}
