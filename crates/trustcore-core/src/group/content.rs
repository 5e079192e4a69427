//! Group session payloads: room key shares, key requests, exports and room
//! ciphertexts.

use serde::{Deserialize, Serialize};
use trustcore_crypto::{AgreementPublicKey, NONCE_SIZE, Signature, SigningPublicKey};

use crate::{
    ids::{DeviceId, RoomId},
    ratchet::RatchetSnapshot,
    transcript::Transcript,
};

/// A session key as shared with a room member over a pairwise channel.
///
/// The sender's identity key is not part of the content: the recipient takes
/// it from the authenticated pairwise envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// Room the session encrypts for
    pub room_id: RoomId,
    /// Session id (hex of `signing_key`)
    pub session_id: String,
    /// Ratchet position the recipient may decrypt from
    pub session_key: RatchetSnapshot,
    /// Key signing every message of the session
    pub signing_key: SigningPublicKey,
}

/// Whether a key request is being made or withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestAction {
    /// Ask own devices for a missing session
    Request,
    /// Withdraw an earlier request
    RequestCancellation,
}

/// Identifies the session a key request is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// Room of the session
    pub room_id: RoomId,
    /// Identity key of the device that created the session
    pub sender_key: AgreementPublicKey,
    /// Session id
    pub session_id: String,
}

/// Room key request or cancellation, sent to the user's own devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Request or cancellation
    pub action: KeyRequestAction,
    /// Id shared by a request and its cancellation
    pub request_id: String,
    /// Device asking
    pub requesting_device_id: DeviceId,
    /// Requested session; absent on cancellations
    pub body: Option<RequestedKeyInfo>,
}

/// Portable form of an inbound session, used for export files, key
/// backup and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// Room of the session
    pub room_id: RoomId,
    /// Identity key of the device that created the session
    pub sender_key: AgreementPublicKey,
    /// Session id
    pub session_id: String,
    /// Ratchet position at the exported index
    pub session_key: RatchetSnapshot,
    /// Session signing key
    pub signing_key: SigningPublicKey,
    /// Signing key the creating device claimed when the session arrived
    pub sender_claimed_signing_key: Option<SigningPublicKey>,
}

impl ExportedRoomKey {
    /// First message index this export can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.session_key.index
    }
}

/// An encrypted room message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCiphertext {
    /// Room the message belongs to
    pub room_id: RoomId,
    /// Identity key of the sending device
    pub sender_key: AgreementPublicKey,
    /// Sending device
    pub device_id: DeviceId,
    /// Outbound session used
    pub session_id: String,
    /// Ratchet index of the message key
    pub message_index: u32,
    /// AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD ciphertext with tag
    pub ciphertext: Vec<u8>,
    /// Session signature over everything above
    pub signature: Signature,
}

impl RoomCiphertext {
    pub(crate) fn signed_bytes(
        room_id: &RoomId,
        sender_key: &AgreementPublicKey,
        session_id: &str,
        message_index: u32,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Vec<u8> {
        Transcript::new("trustcore.room_message.v1")
            .field(room_id.as_str())
            .field(sender_key.as_bytes())
            .field(session_id)
            .u32(message_index)
            .field(nonce)
            .field(ciphertext)
            .finish()
    }

    pub(crate) fn associated_data(room_id: &RoomId, session_id: &str, message_index: u32) -> Vec<u8> {
        Transcript::new("trustcore.room_aad.v1")
            .field(room_id.as_str())
            .field(session_id)
            .u32(message_index)
            .finish()
    }
}

/// Session id derived from a session signing key.
pub(crate) fn session_id_for(signing_key: &SigningPublicKey) -> String {
    signing_key.to_hex()
}
