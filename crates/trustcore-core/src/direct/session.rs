//! Pairwise session key agreement, envelope and plaintext binding.
//!
//! # Establishment
//!
//! The initiator A generates an ephemeral key E and, if the recipient B
//! published one, claims a one-time key O. With identity keys I:
//!
//! ```text
//! with one-time key:     DH(I_a, O_b) || DH(E_a, I_b) || DH(E_a, O_b)
//! without one-time key:  DH(I_a, I_b) || DH(E_a, I_b)
//! seed = HKDF(secret, info = "trustcore.direct.root.v1")
//! ```
//!
//! The seed starts a one-directional ratchet. Every message A sends on the
//! session carries the pre-key header, so B can establish the session from
//! whichever message arrives first. B answers on its own session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trustcore_crypto::{
    AgreementPublicKey, AgreementSecret, CryptoPrimitives, KEY_SIZE, NONCE_SIZE, SigningPublicKey,
};
use zeroize::Zeroize;

use super::error::DirectSessionError;
use crate::{
    devices::DeviceIdentity,
    ids::{DeviceId, UserId},
    messages::RawContent,
    ratchet::Ratchet,
    transcript::Transcript,
};

/// Maximum messages a pairwise chain may skip.
pub const MAX_DIRECT_SKIP: u32 = 1000;

const ROOT_INFO: &[u8] = b"trustcore.direct.root.v1";

/// Key material a recipient needs to establish the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyHeader {
    /// Initiator's ephemeral key
    pub ephemeral_key: AgreementPublicKey,
    /// Recipient's one-time key, if one was claimed
    pub one_time_key: Option<AgreementPublicKey>,
}

/// Encrypted pairwise envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Sender's identity key
    pub sender_key: AgreementPublicKey,
    /// Session id
    pub session_id: String,
    /// Establishment material, present on every message of the session
    pub pre_key: Option<PreKeyHeader>,
    /// Ratchet index
    pub index: u32,
    /// AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD ciphertext
    pub ciphertext: Vec<u8>,
}

impl DirectMessage {
    pub(crate) fn associated_data(
        session_id: &str,
        index: u32,
        sender_key: &AgreementPublicKey,
        recipient_key: &AgreementPublicKey,
    ) -> Vec<u8> {
        Transcript::new("trustcore.direct.v1")
            .field(session_id)
            .u32(index)
            .field(sender_key.as_bytes())
            .field(recipient_key.as_bytes())
            .finish()
    }
}

/// Decrypted plaintext before its bindings are checked.
///
/// Binding fields are optional only so that their absence can be reported
/// precisely; a plaintext missing any of them is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct DirectPlaintext {
    pub(crate) sender: Option<UserId>,
    pub(crate) sender_device: Option<DeviceId>,
    pub(crate) sender_signing_key: Option<SigningPublicKey>,
    pub(crate) recipient: Option<UserId>,
    pub(crate) recipient_signing_key: Option<SigningPublicKey>,
    pub(crate) payload: Option<RawContent>,
}

impl DirectPlaintext {
    pub(crate) fn bound(own: &DeviceIdentity, recipient: &DeviceIdentity, payload: RawContent) -> Self {
        Self {
            sender: Some(own.user_id.clone()),
            sender_device: Some(own.device_id.clone()),
            sender_signing_key: Some(own.signing_key),
            recipient: Some(recipient.user_id.clone()),
            recipient_signing_key: Some(recipient.signing_key),
            payload: Some(payload),
        }
    }

    /// Check every binding against the device owning the envelope's identity
    /// key and against this device, then release the payload.
    pub(crate) fn check_binding(
        self,
        own: &DeviceIdentity,
        sender: &DeviceIdentity,
    ) -> Result<RawContent, DirectSessionError> {
        let claimed_sender = required(self.sender, "sender")?;
        let claimed_device = required(self.sender_device, "sender_device")?;
        let claimed_signing_key = required(self.sender_signing_key, "sender_signing_key")?;
        let recipient = required(self.recipient, "recipient")?;
        let recipient_signing_key = required(self.recipient_signing_key, "recipient_signing_key")?;
        let payload = required(self.payload, "payload")?;

        if recipient != own.user_id {
            return Err(DirectSessionError::RecipientMismatch { field: "recipient" });
        }
        if recipient_signing_key != own.signing_key {
            return Err(DirectSessionError::RecipientMismatch { field: "recipient_signing_key" });
        }
        if claimed_sender != sender.user_id {
            return Err(DirectSessionError::SenderMismatch { field: "sender" });
        }
        if claimed_device != sender.device_id {
            return Err(DirectSessionError::SenderMismatch { field: "sender_device" });
        }
        if claimed_signing_key != sender.signing_key {
            return Err(DirectSessionError::SenderMismatch { field: "sender_signing_key" });
        }
        Ok(payload)
    }
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, DirectSessionError> {
    value.ok_or(DirectSessionError::MissingBinding { field })
}

/// Our sending session towards one peer device.
pub(crate) struct OutboundDirect {
    pub(crate) session_id: String,
    pub(crate) header: PreKeyHeader,
    pub(crate) ratchet: Ratchet,
}

/// Both directions of the pairwise channel with one peer device.
#[derive(Default)]
pub(crate) struct PeerSessions {
    pub(crate) outbound: Option<OutboundDirect>,
    pub(crate) inbound: BTreeMap<String, Ratchet>,
}

/// Session id both sides derive from the establishment keys.
pub(crate) fn session_id(
    crypto: &dyn CryptoPrimitives,
    initiator_identity: &AgreementPublicKey,
    recipient_identity: &AgreementPublicKey,
    ephemeral: &AgreementPublicKey,
) -> String {
    let transcript = Transcript::new("trustcore.direct.session.v1")
        .field(initiator_identity.as_bytes())
        .field(recipient_identity.as_bytes())
        .field(ephemeral.as_bytes())
        .finish();
    hex::encode(crypto.sha256(&transcript))
}

/// Initiator side of the key agreement.
pub(crate) fn initiator_seed(
    crypto: &dyn CryptoPrimitives,
    identity_secret: &AgreementSecret,
    ephemeral_secret: &AgreementSecret,
    their_identity: &AgreementPublicKey,
    their_one_time_key: Option<&AgreementPublicKey>,
) -> Result<[u8; KEY_SIZE], DirectSessionError> {
    let mut secret = Vec::with_capacity(3 * KEY_SIZE);
    let first_target = their_one_time_key.unwrap_or(their_identity);
    secret.extend_from_slice(crypto.key_agreement(identity_secret, first_target)?.as_bytes());
    secret.extend_from_slice(crypto.key_agreement(ephemeral_secret, their_identity)?.as_bytes());
    if let Some(one_time_key) = their_one_time_key {
        secret.extend_from_slice(crypto.key_agreement(ephemeral_secret, one_time_key)?.as_bytes());
    }
    derive_seed(crypto, secret)
}

/// Responder side of the key agreement.
pub(crate) fn responder_seed(
    crypto: &dyn CryptoPrimitives,
    identity_secret: &AgreementSecret,
    one_time_secret: Option<&AgreementSecret>,
    their_identity: &AgreementPublicKey,
    their_ephemeral: &AgreementPublicKey,
) -> Result<[u8; KEY_SIZE], DirectSessionError> {
    let mut secret = Vec::with_capacity(3 * KEY_SIZE);
    let first_secret = one_time_secret.unwrap_or(identity_secret);
    secret.extend_from_slice(crypto.key_agreement(first_secret, their_identity)?.as_bytes());
    secret.extend_from_slice(crypto.key_agreement(identity_secret, their_ephemeral)?.as_bytes());
    if let Some(one_time_secret) = one_time_secret {
        secret.extend_from_slice(crypto.key_agreement(one_time_secret, their_ephemeral)?.as_bytes());
    }
    derive_seed(crypto, secret)
}

fn derive_seed(
    crypto: &dyn CryptoPrimitives,
    mut secret: Vec<u8>,
) -> Result<[u8; KEY_SIZE], DirectSessionError> {
    let mut seed = [0u8; KEY_SIZE];
    let derived = crypto.hkdf_sha256(&secret, &[], ROOT_INFO, &mut seed);
    secret.zeroize();
    derived?;
    Ok(seed)
}
