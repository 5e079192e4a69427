//! Outbound group sessions and the rotation rule.
//!
//! # Sharing bookkeeping
//!
//! Each session tracks three disjoint device sets:
//!
//! - `shared_with`: devices that received the session key
//! - `in_flight`: devices a share is currently being sent to
//! - `withheld`: devices whose share failed at the transport layer
//!
//! Rotation is decided against the union of these sets, so a concurrent
//! encrypt that finds a share in flight neither rotates nor re-sends it, and
//! a device whose delivery failed is retried with the same session instead of
//! forcing a rotation.

use std::{collections::BTreeSet, fmt, ops::Sub, time::Duration};

use trustcore_crypto::{
    AgreementPublicKey, CryptoPrimitives, SigningPublicKey, SigningSecret,
};

use super::{
    content::{ExportedRoomKey, RoomCiphertext, RoomKeyContent, session_id_for},
    error::GroupSessionError,
    inbound::{InboundGroupSession, SessionOrigin},
};
use crate::{
    config::GroupSessionConfig,
    env::Environment,
    ids::{DeviceAddress, DeviceId, RoomId},
    ratchet::{NONCE_RANDOM_SIZE, Ratchet},
};

/// Why an outbound session was replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationReason {
    /// Session reached the rotation period
    Expired,
    /// Session reached the message count limit
    MessageLimit,
    /// A device holding the key is no longer eligible
    DeviceLeft(DeviceAddress),
    /// An eligible device never received the key
    DeviceJoined(DeviceAddress),
    /// Explicitly discarded
    Discarded,
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("expired"),
            Self::MessageLimit => f.write_str("message limit reached"),
            Self::DeviceLeft(device) => write!(f, "{device} no longer eligible"),
            Self::DeviceJoined(device) => write!(f, "{device} joined"),
            Self::Discarded => f.write_str("discarded"),
        }
    }
}

/// Read-only view of a room's active outbound session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSessionInfo {
    /// Room of the session
    pub room_id: RoomId,
    /// Session id
    pub session_id: String,
    /// Messages encrypted so far
    pub use_count: u32,
    /// Devices that received the key
    pub shared_with: BTreeSet<DeviceAddress>,
    /// Devices whose share failed and will be retried
    pub withheld: BTreeSet<DeviceAddress>,
}

pub(crate) struct OutboundGroupSession<I> {
    room_id: RoomId,
    session_id: String,
    created_at: I,
    use_count: u32,
    ratchet: Ratchet,
    signing_secret: SigningSecret,
    signing_key: SigningPublicKey,
    shared_with: BTreeSet<DeviceAddress>,
    in_flight: BTreeSet<DeviceAddress>,
    withheld: BTreeSet<DeviceAddress>,
}

impl<I> OutboundGroupSession<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    pub(crate) fn new<E: Environment<Instant = I>>(
        env: &E,
        crypto: &dyn CryptoPrimitives,
        room_id: RoomId,
    ) -> Self {
        let signing_secret = SigningSecret::from_bytes(env.random_key());
        let signing_key = crypto.signing_public_key(&signing_secret);
        Self {
            room_id,
            session_id: session_id_for(&signing_key),
            created_at: env.now(),
            use_count: 0,
            ratchet: Ratchet::new(env.random_key()),
            signing_secret,
            signing_key,
            shared_with: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            withheld: BTreeSet::new(),
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn info(&self) -> OutboundSessionInfo {
        OutboundSessionInfo {
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            use_count: self.use_count,
            shared_with: self.shared_with.clone(),
            withheld: self.withheld.clone(),
        }
    }

    /// First rotation criterion this session meets, if any.
    pub(crate) fn rotation_reason(
        &self,
        now: I,
        eligible: &BTreeSet<DeviceAddress>,
        config: &GroupSessionConfig,
    ) -> Option<RotationReason> {
        if now - self.created_at >= config.rotation_period {
            return Some(RotationReason::Expired);
        }
        if self.use_count >= config.rotation_message_count {
            return Some(RotationReason::MessageLimit);
        }
        if let Some(left) =
            self.shared_with.iter().chain(&self.in_flight).find(|d| !eligible.contains(*d))
        {
            return Some(RotationReason::DeviceLeft(left.clone()));
        }
        eligible
            .iter()
            .find(|d| {
                !self.shared_with.contains(*d)
                    && !self.in_flight.contains(*d)
                    && !self.withheld.contains(*d)
            })
            .map(|joined| RotationReason::DeviceJoined(joined.clone()))
    }

    /// Eligible devices that hold neither the key nor a share in flight.
    ///
    /// Withheld devices that are no longer eligible are forgotten here.
    pub(crate) fn pending_targets(&mut self, eligible: &BTreeSet<DeviceAddress>) -> Vec<DeviceAddress> {
        self.withheld.retain(|d| eligible.contains(d));
        eligible
            .iter()
            .filter(|d| !self.shared_with.contains(*d) && !self.in_flight.contains(*d))
            .cloned()
            .collect()
    }

    pub(crate) fn begin_share(&mut self, targets: &[DeviceAddress]) {
        for target in targets {
            self.withheld.remove(target);
            self.in_flight.insert(target.clone());
        }
    }

    pub(crate) fn finish_share(&mut self, delivered: &[DeviceAddress], failed: &[DeviceAddress]) {
        for device in delivered {
            self.in_flight.remove(device);
            self.shared_with.insert(device.clone());
        }
        for device in failed {
            self.in_flight.remove(device);
            self.withheld.insert(device.clone());
        }
    }

    /// Key share at the current ratchet position.
    pub(crate) fn room_key(&self) -> RoomKeyContent {
        RoomKeyContent {
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            session_key: self.ratchet.snapshot(),
            signing_key: self.signing_key,
        }
    }

    /// Inbound copy for decrypting our own messages and for backup.
    ///
    /// Taken before the first encryption so it starts at index 0.
    pub(crate) fn own_inbound(
        &self,
        sender_key: AgreementPublicKey,
        own_signing_key: SigningPublicKey,
    ) -> Result<InboundGroupSession, GroupSessionError> {
        let export = ExportedRoomKey {
            room_id: self.room_id.clone(),
            sender_key,
            session_id: self.session_id.clone(),
            session_key: self.ratchet.snapshot(),
            signing_key: self.signing_key,
            sender_claimed_signing_key: Some(own_signing_key),
        };
        InboundGroupSession::from_export(&export, SessionOrigin::Own)
    }

    /// Encrypt one message and count it.
    pub(crate) fn encrypt(
        &mut self,
        crypto: &dyn CryptoPrimitives,
        random_suffix: [u8; NONCE_RANDOM_SIZE],
        sender_key: AgreementPublicKey,
        device_id: &DeviceId,
        plaintext: &[u8],
    ) -> Result<RoomCiphertext, GroupSessionError> {
        let key = self.ratchet.advance(crypto)?;
        let index = key.index();
        let aad = RoomCiphertext::associated_data(&self.room_id, &self.session_id, index);
        let (nonce, ciphertext) = key.seal(crypto, random_suffix, &aad, plaintext)?;

        let signed = RoomCiphertext::signed_bytes(
            &self.room_id,
            &sender_key,
            &self.session_id,
            index,
            &nonce,
            &ciphertext,
        );
        let signature = crypto.sign(&self.signing_secret, &signed);
        self.use_count += 1;

        Ok(RoomCiphertext {
            room_id: self.room_id.clone(),
            sender_key,
            device_id: device_id.clone(),
            session_id: self.session_id.clone(),
            message_index: index,
            nonce,
            ciphertext,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use trustcore_crypto::{AgreementSecret, RustCryptoPrimitives};

    use super::*;
    use crate::{env::test_utils::MockEnv, group::GroupSessionError};

    fn devices(names: &[&str]) -> BTreeSet<DeviceAddress> {
        names.iter().map(|n| DeviceAddress::new("@bob:x", *n)).collect()
    }

    fn sender_key(crypto: &dyn CryptoPrimitives) -> AgreementPublicKey {
        crypto.agreement_public_key(&AgreementSecret::from_bytes([9u8; 32]))
    }

    #[test]
    fn fresh_session_wants_every_eligible_device() {
        let env = MockEnv::with_seed(1);
        let crypto = RustCryptoPrimitives::new();
        let mut session = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        let eligible = devices(&["B1", "B2"]);

        let targets = session.pending_targets(&eligible);
        assert_eq!(targets.len(), 2);
        session.begin_share(&targets);
        assert!(session.rotation_reason(env.now(), &eligible, &GroupSessionConfig::default()).is_none());
        assert!(session.pending_targets(&eligible).is_empty(), "in-flight devices are covered");
    }

    #[test]
    fn rotation_criteria() {
        let env = MockEnv::with_seed(2);
        let crypto = RustCryptoPrimitives::new();
        let config = GroupSessionConfig { rotation_message_count: 2, ..Default::default() };
        let mut session = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        let eligible = devices(&["B1"]);
        let targets = session.pending_targets(&eligible);
        session.begin_share(&targets);
        session.finish_share(&[DeviceAddress::new("@bob:x", "B1")], &[]);

        assert_eq!(session.rotation_reason(env.now(), &eligible, &config), None);
        assert_eq!(
            session.rotation_reason(env.now(), &devices(&[]), &config),
            Some(RotationReason::DeviceLeft(DeviceAddress::new("@bob:x", "B1")))
        );
        assert_eq!(
            session.rotation_reason(env.now(), &devices(&["B1", "B2"]), &config),
            Some(RotationReason::DeviceJoined(DeviceAddress::new("@bob:x", "B2")))
        );

        let key = sender_key(&crypto);
        for _ in 0..2 {
            session.encrypt(&crypto, [0; NONCE_RANDOM_SIZE], key, &DeviceId::from("A1"), b"m").unwrap();
        }
        assert_eq!(session.rotation_reason(env.now(), &eligible, &config), Some(RotationReason::MessageLimit));

        let fresh = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        env.advance(config.rotation_period);
        assert_eq!(fresh.rotation_reason(env.now(), &devices(&[]), &config), Some(RotationReason::Expired));
    }

    #[test]
    fn withheld_devices_are_retried_without_rotation() {
        let env = MockEnv::with_seed(3);
        let crypto = RustCryptoPrimitives::new();
        let mut session = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        let eligible = devices(&["B1", "B2"]);

        let targets = session.pending_targets(&eligible);
        session.begin_share(&targets);
        session.finish_share(&targets[..1], &targets[1..]);

        assert!(session.rotation_reason(env.now(), &eligible, &GroupSessionConfig::default()).is_none());
        assert_eq!(session.pending_targets(&eligible), targets[1..].to_vec());
        assert_eq!(session.info().withheld.len(), 1);
    }

    #[test]
    fn own_inbound_decrypts_every_message() {
        let env = MockEnv::with_seed(4);
        let crypto = RustCryptoPrimitives::new();
        let mut session = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        let key = sender_key(&crypto);
        let signing = crypto.signing_public_key(&SigningSecret::from_bytes([5u8; 32]));
        let inbound = session.own_inbound(key, signing).unwrap();

        let first = session.encrypt(&crypto, [1; NONCE_RANDOM_SIZE], key, &DeviceId::from("A1"), b"one").unwrap();
        let second = session.encrypt(&crypto, [2; NONCE_RANDOM_SIZE], key, &DeviceId::from("A1"), b"two").unwrap();

        assert_eq!(inbound.decrypt(&crypto, &second).unwrap(), b"two");
        assert_eq!(inbound.decrypt(&crypto, &first).unwrap(), b"one");
        assert_eq!(inbound.first_known_index(), 0);
    }

    #[test]
    fn late_share_cannot_decrypt_earlier_messages() {
        let env = MockEnv::with_seed(5);
        let crypto = RustCryptoPrimitives::new();
        let mut session = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        let key = sender_key(&crypto);

        let early = session.encrypt(&crypto, [0; NONCE_RANDOM_SIZE], key, &DeviceId::from("A1"), b"early").unwrap();
        let share = session.room_key();
        let late = session.encrypt(&crypto, [0; NONCE_RANDOM_SIZE], key, &DeviceId::from("A1"), b"late").unwrap();

        let sender = crate::devices::DeviceIdentity {
            user_id: "@alice:x".into(),
            device_id: "A1".into(),
            identity_key: key,
            signing_key: share.signing_key,
            trust: crate::devices::TrustState::Unknown,
            stale: false,
        };
        let inbound = InboundGroupSession::from_room_key(&sender, &share).unwrap();
        assert_eq!(inbound.first_known_index(), 1);
        assert_eq!(inbound.decrypt(&crypto, &late).unwrap(), b"late");
        assert!(matches!(
            inbound.decrypt(&crypto, &early),
            Err(GroupSessionError::UnknownMessageIndex { first_known: 1, requested: 0 })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_signature_check() {
        let env = MockEnv::with_seed(6);
        let crypto = RustCryptoPrimitives::new();
        let mut session = OutboundGroupSession::new(&env, &crypto, RoomId::from("!r:x"));
        let key = sender_key(&crypto);
        let signing = crypto.signing_public_key(&SigningSecret::from_bytes([5u8; 32]));
        let inbound = session.own_inbound(key, signing).unwrap();

        let mut message = session.encrypt(&crypto, [0; NONCE_RANDOM_SIZE], key, &DeviceId::from("A1"), b"hi").unwrap();
        message.ciphertext[0] ^= 1;
        assert!(matches!(
            inbound.decrypt(&crypto, &message),
            Err(GroupSessionError::Crypto(trustcore_crypto::CryptoError::InvalidSignature))
        ));
    }
}
