//! Error types for the verification engine

use thiserror::Error;

use super::{cancel::CancelCode, methods::VerificationMethod, qr::QrDecodeError};
use crate::{
    codec::CodecError,
    devices::DeviceKeyError,
    direct::DirectSessionError,
    ids::{DeviceAddress, UserId},
    store::StoreError,
    transport::TransportError,
};

/// Errors returned to callers of the verification engine.
///
/// Protocol violations by the peer are not errors: they cancel the
/// transaction and surface through its state.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// No request or transaction with this id
    #[error("unknown verification transaction {0}")]
    UnknownTransaction(String),

    /// Peer device not in the device store
    #[error("unknown device {0}")]
    UnknownDevice(DeviceAddress),

    /// User has no device a request could go to
    #[error("no verifiable devices for {0}")]
    NoDevices(UserId),

    /// Action not valid in the current state
    #[error("cannot {action} transaction {transaction_id} in its current state")]
    InvalidState {
        /// Transaction id
        transaction_id: String,
        /// Attempted action
        action: &'static str,
    },

    /// Method not supported by both sides
    #[error("{0} is not supported by both devices")]
    MethodUnsupported(VerificationMethod),

    /// Scanned bytes are not a usable QR code
    #[error(transparent)]
    InvalidQrCode(#[from] QrDecodeError),

    /// Action cancelled the transaction
    #[error("verification cancelled: {0}")]
    Cancelled(CancelCode),

    /// Pairwise channel failure
    #[error(transparent)]
    Direct(#[from] DirectSessionError),

    /// Device store failure
    #[error(transparent)]
    Device(#[from] DeviceKeyError),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Room transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}
