//! QR code payload.
//!
//! # Wire Format
//!
//! ```text
//! "TCQR" | version (1) | mode (1) | txn len (u16 BE) | txn | key1 (32) | key2 (32) | secret
//! ```
//!
//! `key1` is the displaying device's signing key, `key2` the signing key the
//! displaying device holds for the scanning device. The scanner checks both
//! against its own records and echoes `secret` back in a reciprocate start.

use thiserror::Error;
use trustcore_crypto::{KEY_SIZE, SigningPublicKey};

const HEADER: &[u8; 4] = b"TCQR";

/// Current payload version
pub const QR_VERSION: u8 = 0x01;

/// Length of the shared secret we generate
pub const QR_SECRET_SIZE: usize = 16;

/// Shortest secret accepted from a peer
const MIN_SECRET_SIZE: usize = 8;

const FIXED_SIZE: usize = HEADER.len() + 1 + 1 + 2;

/// Whose devices the code verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrMode {
    /// Scanner belongs to another user
    OtherUser,
    /// Scanner is another device of the same user
    SelfVerifying,
}

impl QrMode {
    fn to_byte(self) -> u8 {
        match self {
            Self::OtherUser => 0x00,
            Self::SelfVerifying => 0x01,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::OtherUser),
            0x01 => Some(Self::SelfVerifying),
            _ => None,
        }
    }
}

/// Why a scanned payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrDecodeError {
    /// Payload shorter than its fixed fields
    #[error("QR payload truncated")]
    Truncated,

    /// Payload does not start with the expected header
    #[error("not a verification QR code")]
    BadHeader,

    /// Version byte not understood
    #[error("unsupported QR version {0}")]
    UnsupportedVersion(u8),

    /// Mode byte not understood
    #[error("unknown QR mode {0}")]
    UnknownMode(u8),

    /// Transaction id is not UTF-8
    #[error("QR transaction id is not valid UTF-8")]
    InvalidTransactionId,

    /// Secret shorter than the accepted minimum
    #[error("QR secret too short ({0} bytes)")]
    SecretTooShort(usize),
}

/// Decoded QR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCodeData {
    /// Whose devices the code verifies
    pub mode: QrMode,
    /// Transaction the code belongs to
    pub transaction_id: String,
    /// Displaying device's signing key
    pub key1: SigningPublicKey,
    /// Signing key the displaying device holds for the scanner
    pub key2: SigningPublicKey,
    /// Secret the scanner echoes back
    pub secret: Vec<u8>,
}

impl QrCodeData {
    /// Bytes to render as a QR code.
    pub fn encode(&self) -> Vec<u8> {
        let txn = self.transaction_id.as_bytes();
        let mut out = Vec::with_capacity(FIXED_SIZE + txn.len() + 2 * KEY_SIZE + self.secret.len());
        out.extend_from_slice(HEADER);
        out.push(QR_VERSION);
        out.push(self.mode.to_byte());
        // Transaction ids are short; an oversized one is truncated and then
        // fails the scanner's transaction check.
        let txn = &txn[..txn.len().min(usize::from(u16::MAX))];
        out.extend_from_slice(&(txn.len() as u16).to_be_bytes());
        out.extend_from_slice(txn);
        out.extend_from_slice(self.key1.as_bytes());
        out.extend_from_slice(self.key2.as_bytes());
        out.extend_from_slice(&self.secret);
        out
    }

    /// Parse scanned bytes.
    ///
    /// # Errors
    ///
    /// See [`QrDecodeError`].
    pub fn decode(bytes: &[u8]) -> Result<Self, QrDecodeError> {
        if bytes.len() < FIXED_SIZE {
            return Err(QrDecodeError::Truncated);
        }
        if &bytes[..HEADER.len()] != HEADER {
            return Err(QrDecodeError::BadHeader);
        }
        let version = bytes[4];
        if version != QR_VERSION {
            return Err(QrDecodeError::UnsupportedVersion(version));
        }
        let mode = QrMode::from_byte(bytes[5]).ok_or(QrDecodeError::UnknownMode(bytes[5]))?;
        let txn_len = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

        let rest = &bytes[FIXED_SIZE..];
        if rest.len() < txn_len + 2 * KEY_SIZE {
            return Err(QrDecodeError::Truncated);
        }
        let (txn, rest) = rest.split_at(txn_len);
        let (key1, rest) = rest.split_at(KEY_SIZE);
        let (key2, secret) = rest.split_at(KEY_SIZE);
        if secret.len() < MIN_SECRET_SIZE {
            return Err(QrDecodeError::SecretTooShort(secret.len()));
        }

        let transaction_id =
            String::from_utf8(txn.to_vec()).map_err(|_| QrDecodeError::InvalidTransactionId)?;
        let key1 = SigningPublicKey::from_slice(key1).map_err(|_| QrDecodeError::Truncated)?;
        let key2 = SigningPublicKey::from_slice(key2).map_err(|_| QrDecodeError::Truncated)?;
        Ok(Self { mode, transaction_id, key1, key2, secret: secret.to_vec() })
    }
}
