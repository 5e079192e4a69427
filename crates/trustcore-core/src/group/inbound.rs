//! Inbound group sessions.
//!
//! An inbound session is a frozen ratchet snapshot: the position at which we
//! first learned the session. Decrypting message `n` forks a ratchet from the
//! snapshot and skips forward to `n`, so messages can arrive in any order and
//! the stored record itself never advances.

use serde::{Deserialize, Serialize};
use trustcore_crypto::{AgreementPublicKey, CryptoPrimitives, SigningPublicKey};

use super::{
    content::{ExportedRoomKey, RoomCiphertext, RoomKeyContent, session_id_for},
    error::GroupSessionError,
};
use crate::{
    devices::DeviceIdentity,
    ids::RoomId,
    ratchet::{Ratchet, RatchetSnapshot},
};

/// Maximum ratchet steps taken to reach one message index.
///
/// Outbound sessions rotate long before this under default settings.
pub const MAX_INBOUND_SKIP: u32 = 100_000;

/// Store key of an inbound session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InboundSessionKey {
    /// Room of the session
    pub room_id: RoomId,
    /// Identity key of the creating device
    pub sender_key: AgreementPublicKey,
    /// Session id
    pub session_id: String,
}

/// How an inbound session reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Created locally alongside our own outbound session
    Own,
    /// Shared directly by the creating device
    Direct,
    /// Imported from an export file
    Import,
    /// Restored from key backup
    Backup,
}

/// A group session we can decrypt with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundGroupSession {
    room_id: RoomId,
    sender_key: AgreementPublicKey,
    session_id: String,
    signing_key: SigningPublicKey,
    sender_claimed_signing_key: Option<SigningPublicKey>,
    initial: RatchetSnapshot,
    origin: SessionOrigin,
    backed_up: bool,
}

impl InboundGroupSession {
    /// Session received over a pairwise channel from `sender`.
    pub fn from_room_key(
        sender: &DeviceIdentity,
        content: &RoomKeyContent,
    ) -> Result<Self, GroupSessionError> {
        check_session_id(&content.session_id, &content.signing_key)?;
        Ok(Self {
            room_id: content.room_id.clone(),
            sender_key: sender.identity_key,
            session_id: content.session_id.clone(),
            signing_key: content.signing_key,
            sender_claimed_signing_key: Some(sender.signing_key),
            initial: content.session_key.clone(),
            origin: SessionOrigin::Direct,
            backed_up: false,
        })
    }

    /// Session from an export or backup.
    ///
    /// Sessions restored from backup start marked backed up so they are not
    /// uploaded again.
    pub fn from_export(
        export: &ExportedRoomKey,
        origin: SessionOrigin,
    ) -> Result<Self, GroupSessionError> {
        check_session_id(&export.session_id, &export.signing_key)?;
        Ok(Self {
            room_id: export.room_id.clone(),
            sender_key: export.sender_key,
            session_id: export.session_id.clone(),
            signing_key: export.signing_key,
            sender_claimed_signing_key: export.sender_claimed_signing_key,
            initial: export.session_key.clone(),
            origin,
            backed_up: origin == SessionOrigin::Backup,
        })
    }

    /// Store key.
    pub fn key(&self) -> InboundSessionKey {
        InboundSessionKey {
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id.clone(),
        }
    }

    /// Room of the session.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Identity key of the creating device.
    pub fn sender_key(&self) -> AgreementPublicKey {
        self.sender_key
    }

    /// Session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Signing key the creating device claimed.
    pub fn sender_claimed_signing_key(&self) -> Option<SigningPublicKey> {
        self.sender_claimed_signing_key
    }

    /// First message index this session decrypts.
    pub fn first_known_index(&self) -> u32 {
        self.initial.index
    }

    /// How the session arrived.
    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    /// True once uploaded to the current backup version.
    pub fn is_backed_up(&self) -> bool {
        self.backed_up
    }

    pub(crate) fn set_backed_up(&mut self, backed_up: bool) {
        self.backed_up = backed_up;
    }

    /// True if `self` can decrypt strictly more of the session than `other`.
    pub fn is_better_than(&self, other: &Self) -> bool {
        self.first_known_index() < other.first_known_index()
    }

    /// Portable form at the first known index.
    pub fn export(&self) -> ExportedRoomKey {
        ExportedRoomKey {
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id.clone(),
            session_key: self.initial.clone(),
            signing_key: self.signing_key,
            sender_claimed_signing_key: self.sender_claimed_signing_key,
        }
    }

    /// Verify and decrypt a room message.
    ///
    /// The session signature is checked before the AEAD is opened.
    pub fn decrypt(
        &self,
        crypto: &dyn CryptoPrimitives,
        message: &RoomCiphertext,
    ) -> Result<Vec<u8>, GroupSessionError> {
        if message.room_id != self.room_id || message.session_id != self.session_id {
            return Err(GroupSessionError::InvalidSessionData(
                "message does not belong to this session".to_string(),
            ));
        }

        let signed = RoomCiphertext::signed_bytes(
            &message.room_id,
            &message.sender_key,
            &message.session_id,
            message.message_index,
            &message.nonce,
            &message.ciphertext,
        );
        crypto.verify(&self.signing_key, &signed, &message.signature)?;

        if message.message_index < self.first_known_index() {
            return Err(GroupSessionError::UnknownMessageIndex {
                first_known: self.first_known_index(),
                requested: message.message_index,
            });
        }

        let mut ratchet = Ratchet::from_snapshot(&self.initial);
        let key = ratchet.advance_to(crypto, message.message_index, MAX_INBOUND_SKIP)?;
        let aad =
            RoomCiphertext::associated_data(&self.room_id, &self.session_id, message.message_index);
        Ok(key.open(crypto, &message.nonce, &aad, &message.ciphertext)?)
    }
}

fn check_session_id(session_id: &str, signing_key: &SigningPublicKey) -> Result<(), GroupSessionError> {
    if session_id != session_id_for(signing_key) {
        return Err(GroupSessionError::InvalidSessionData(format!(
            "session id {session_id} does not match its signing key"
        )));
    }
    Ok(())
}
