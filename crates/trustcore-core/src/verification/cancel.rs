//! Cancellation codes.
//!
//! The wire strings are part of the interoperable protocol. Codes this client
//! does not recognise parse as [`CancelCode::User`] so that a peer running a
//! newer protocol revision can still cancel.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Why a verification ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCode {
    /// User cancelled
    User,
    /// Transaction or request timed out
    Timeout,
    /// Message referenced a transaction we do not know
    UnknownTransaction,
    /// No mutually supported method
    UnknownMethod,
    /// Key does not match the accepted commitment
    MismatchedCommitment,
    /// User reported the short codes differ
    MismatchedSas,
    /// Message not valid in the current state
    UnexpectedMessage,
    /// Message was malformed
    InvalidMessage,
    /// MAC or QR key did not match the known device key
    KeyMismatch,
    /// User made an error (for example scanned the wrong code)
    UserError,
    /// Message came from a different user than the transaction's peer
    UserMismatch,
    /// QR code could not be used
    QrCodeInvalid,
}

impl CancelCode {
    /// Every code, in wire order.
    pub const ALL: [Self; 12] = [
        Self::User,
        Self::Timeout,
        Self::UnknownTransaction,
        Self::UnknownMethod,
        Self::MismatchedCommitment,
        Self::MismatchedSas,
        Self::UnexpectedMessage,
        Self::InvalidMessage,
        Self::KeyMismatch,
        Self::UserError,
        Self::UserMismatch,
        Self::QrCodeInvalid,
    ];

    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "m.user",
            Self::Timeout => "m.timeout",
            Self::UnknownTransaction => "m.unknown_transaction",
            Self::UnknownMethod => "m.unknown_method",
            Self::MismatchedCommitment => "m.mismatched_commitment",
            Self::MismatchedSas => "m.mismatched_sas",
            Self::UnexpectedMessage => "m.unexpected_message",
            Self::InvalidMessage => "m.invalid_message",
            Self::KeyMismatch => "m.key_mismatch",
            Self::UserError => "m.user_error",
            Self::UserMismatch => "m.user_mismatch",
            Self::QrCodeInvalid => "m.qr_code.invalid",
        }
    }

    /// Parse a wire string. Unrecognised codes become [`Self::User`].
    pub fn from_wire(value: &str) -> Self {
        Self::ALL.into_iter().find(|code| code.as_str() == value).unwrap_or(Self::User)
    }

    /// Human-readable reason sent alongside the code.
    pub fn reason(self) -> &'static str {
        match self {
            Self::User => "The user cancelled the verification.",
            Self::Timeout => "The verification process timed out.",
            Self::UnknownTransaction => "The device does not know about that transaction.",
            Self::UnknownMethod => "The device can't agree on a verification method.",
            Self::MismatchedCommitment => "The hash commitment did not match.",
            Self::MismatchedSas => "The SAS did not match.",
            Self::UnexpectedMessage => "The device received an unexpected message.",
            Self::InvalidMessage => "An invalid message was received.",
            Self::KeyMismatch => "The key was not verified.",
            Self::UserError => "The user made an error.",
            Self::UserMismatch => "The expected user did not match the user verified.",
            Self::QrCodeInvalid => "Invalid QR code.",
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CancelCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CancelCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&value))
    }
}
