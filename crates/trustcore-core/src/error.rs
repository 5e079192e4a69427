//! Top-level error type for the [`Machine`](crate::Machine) facade.

use thiserror::Error;

use crate::{
    backup::BackupError, codec::CodecError, devices::DeviceKeyError, direct::DirectSessionError,
    group::GroupSessionError, store::StoreError, verification::VerificationError,
};

/// Errors surfaced by [`Machine`](crate::Machine).
#[derive(Debug, Error)]
pub enum MachineError {
    /// Pairwise channel failure, including forged or misdirected messages
    #[error(transparent)]
    Direct(#[from] DirectSessionError),

    /// Group session failure
    #[error(transparent)]
    Group(#[from] GroupSessionError),

    /// Verification failure
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Backup or recovery failure
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Device key bookkeeping failure
    #[error(transparent)]
    Device(#[from] DeviceKeyError),

    /// Payload encoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MachineError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Direct(err) => err.is_transient(),
            Self::Backup(err) => err.is_transient(),
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if a received message was forged, replayed or
    /// misdirected.
    pub fn is_tamper(&self) -> bool {
        matches!(self, Self::Direct(err) if err.is_tamper())
    }
}
