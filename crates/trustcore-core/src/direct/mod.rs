//! Pairwise device-to-device encryption.
//!
//! A session is established with a triple Diffie-Hellman between the two
//! identity keys, a fresh ephemeral key and, when one can be claimed, a
//! one-time key of the recipient. Every plaintext binds sender and recipient
//! so a captured message cannot be replayed to another device or re-attributed
//! to another sender.

mod codec;
mod error;
mod session;

pub use codec::{DecryptedToDevice, DirectSessionCodec};
pub use error::DirectSessionError;
pub use session::{DirectMessage, MAX_DIRECT_SKIP, PreKeyHeader};
