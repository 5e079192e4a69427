//! The pairwise channel: establishment, encryption and binding-checked
//! decryption, serialized per peer device.

use std::sync::Arc;

use tracing::{debug, warn};
use trustcore_crypto::{AgreementPublicKey, AgreementSecret, CryptoPrimitives};

use super::{
    error::DirectSessionError,
    session::{
        DirectMessage, DirectPlaintext, MAX_DIRECT_SKIP, OutboundDirect, PeerSessions,
        PreKeyHeader, initiator_seed, responder_seed, session_id,
    },
};
use crate::{
    codec,
    devices::{DeviceIdentity, DeviceKeyStore},
    env::Environment,
    ids::{DeviceAddress, UserId},
    messages::ToDeviceContent,
    ratchet::{NONCE_RANDOM_SIZE, Ratchet},
    scope::ScopeArena,
    store::CryptoStore,
    transport::Transport,
};

/// Content decrypted from a peer device, with that device's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedToDevice {
    /// Device that sent the message; owns the envelope's identity key
    pub sender: DeviceIdentity,
    /// Decrypted content
    pub content: ToDeviceContent,
}

/// Pairwise encrypted channels to peer devices.
pub struct DirectSessionCodec<E: Environment, S: CryptoStore> {
    env: E,
    crypto: Arc<dyn CryptoPrimitives>,
    devices: Arc<DeviceKeyStore<S>>,
    transport: Arc<dyn Transport>,
    peers: ScopeArena<DeviceAddress, PeerSessions>,
}

impl<E: Environment, S: CryptoStore> DirectSessionCodec<E, S> {
    /// Create a codec with no sessions.
    pub fn new(
        env: E,
        crypto: Arc<dyn CryptoPrimitives>,
        devices: Arc<DeviceKeyStore<S>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self { env, crypto, devices, transport, peers: ScopeArena::new() }
    }

    /// True if we hold a sending session towards `device`.
    pub async fn has_outbound_session(&self, device: &DeviceAddress) -> bool {
        match self.peers.get(device) {
            Some(scope) => scope.lock().await.outbound.is_some(),
            None => false,
        }
    }

    /// Encrypt `content` for one device, establishing a session first if
    /// none exists.
    ///
    /// The one-time key claim happens with the peer's scope unlocked; if a
    /// concurrent call established the session meanwhile, that session is
    /// used and the claimed key is left unused.
    pub async fn encrypt_for(
        &self,
        recipient: &DeviceIdentity,
        content: &ToDeviceContent,
    ) -> Result<Vec<u8>, DirectSessionError> {
        let raw = content.to_raw()?;
        let scope = self.peers.get_or_insert_with(&recipient.address(), PeerSessions::default);

        let needs_session = scope.lock().await.outbound.is_none();
        let one_time_key =
            if needs_session { self.claim_one_time_key(recipient).await } else { None };

        let own = self.devices.own_identity();
        let mut peer = scope.lock().await;
        let outbound = match &mut peer.outbound {
            Some(outbound) => outbound,
            slot @ None => slot.insert(self.establish(&own, recipient, one_time_key)?),
        };

        let plaintext = codec::encode(&DirectPlaintext::bound(&own, recipient, raw))?;
        let key = outbound.ratchet.advance(self.crypto.as_ref())?;
        let aad = DirectMessage::associated_data(
            &outbound.session_id,
            key.index(),
            &own.identity_key,
            &recipient.identity_key,
        );
        let mut suffix = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut suffix);
        let (nonce, ciphertext) = key.seal(self.crypto.as_ref(), suffix, &aad, &plaintext)?;

        let message = DirectMessage {
            sender_key: own.identity_key,
            session_id: outbound.session_id.clone(),
            pre_key: Some(outbound.header),
            index: key.index(),
            nonce,
            ciphertext,
        };
        Ok(codec::encode(&message)?)
    }

    /// Encrypt `content` for several devices. One device failing does not
    /// affect the others.
    pub async fn encrypt_for_devices(
        &self,
        recipients: &[DeviceIdentity],
        content: &ToDeviceContent,
    ) -> Vec<(DeviceAddress, Result<Vec<u8>, DirectSessionError>)> {
        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            results.push((recipient.address(), self.encrypt_for(recipient, content).await));
        }
        results
    }

    /// Encrypt and deliver `content` to one device, retrying transient
    /// transport failures up to `attempts` times in total.
    ///
    /// Each attempt re-encrypts, so a retried message uses a fresh index.
    pub async fn send(
        &self,
        recipient: &DeviceIdentity,
        content: &ToDeviceContent,
        attempts: u32,
    ) -> Result<(), DirectSessionError> {
        let address = recipient.address();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let payload = self.encrypt_for(recipient, content).await?;
            match self.transport.send_to_device(&address, payload).await {
                Ok(()) => {
                    debug!(device = %address, kind = content.kind(), attempt, "to-device sent");
                    return Ok(());
                },
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(device = %address, attempt, error = %err, "to-device send failed, retrying");
                },
                Err(err) => {
                    warn!(device = %address, attempt, error = %err, "to-device send failed");
                    return Err(err.into());
                },
            }
        }
    }

    /// Decrypt a payload sent by `sender_user`.
    ///
    /// Session state only advances once the message authenticated and every
    /// binding in the plaintext matched.
    ///
    /// # Errors
    ///
    /// - `UnknownSender` if no known device of the user owns the identity key
    /// - `MissingBinding`, `RecipientMismatch`, `SenderMismatch` on binding
    ///   failures
    /// - `Crypto`, `Ratchet` on forged, tampered or replayed messages
    pub async fn decrypt(
        &self,
        sender_user: &UserId,
        payload: &[u8],
    ) -> Result<DecryptedToDevice, DirectSessionError> {
        let message: DirectMessage = codec::decode(payload)?;
        let sender = self
            .devices
            .device_by_identity_key(sender_user, &message.sender_key)?
            .ok_or_else(|| DirectSessionError::UnknownSender {
                user_id: sender_user.clone(),
                identity_key: message.sender_key,
            })?;
        let own = self.devices.own_identity();

        let scope = self.peers.get_or_insert_with(&sender.address(), PeerSessions::default);
        let mut peer = scope.lock().await;

        let (mut ratchet, one_time_key) = match peer.inbound.get(&message.session_id) {
            Some(existing) => (Ratchet::from_snapshot(&existing.snapshot()), None),
            None => {
                let header = message
                    .pre_key
                    .ok_or_else(|| DirectSessionError::UnknownSession(message.session_id.clone()))?;
                self.accept_pre_key(&own, &sender, &message.session_id, &header)?
            },
        };

        let key = ratchet.advance_to(self.crypto.as_ref(), message.index, MAX_DIRECT_SKIP)?;
        let aad = DirectMessage::associated_data(
            &message.session_id,
            message.index,
            &message.sender_key,
            &own.identity_key,
        );
        let plaintext = key.open(self.crypto.as_ref(), &message.nonce, &aad, &message.ciphertext)?;
        let raw = codec::decode::<DirectPlaintext>(&plaintext)?.check_binding(&own, &sender)?;

        let established = !peer.inbound.contains_key(&message.session_id);
        peer.inbound.insert(message.session_id.clone(), ratchet);
        drop(peer);

        if let Some(one_time_key) = one_time_key {
            self.devices.consume_one_time_key(&one_time_key);
        }
        if established {
            debug!(device = %sender.address(), session_id = %message.session_id, "inbound pairwise session established");
        }

        let content = ToDeviceContent::from_raw(&raw)?;
        Ok(DecryptedToDevice { sender, content })
    }

    async fn claim_one_time_key(&self, recipient: &DeviceIdentity) -> Option<AgreementPublicKey> {
        match self.transport.claim_one_time_key(&recipient.address()).await {
            Ok(key) => key,
            Err(err) => {
                warn!(device = %recipient.address(), error = %err, "one-time key claim failed, using identity key only");
                None
            },
        }
    }

    fn establish(
        &self,
        own: &DeviceIdentity,
        recipient: &DeviceIdentity,
        one_time_key: Option<AgreementPublicKey>,
    ) -> Result<OutboundDirect, DirectSessionError> {
        let crypto = self.crypto.as_ref();
        let ephemeral = AgreementSecret::from_bytes(self.env.random_key());
        let ephemeral_key = crypto.agreement_public_key(&ephemeral);
        let seed = initiator_seed(
            crypto,
            self.devices.account().identity_secret(),
            &ephemeral,
            &recipient.identity_key,
            one_time_key.as_ref(),
        )?;
        let id = session_id(crypto, &own.identity_key, &recipient.identity_key, &ephemeral_key);

        debug!(
            device = %recipient.address(),
            session_id = %id,
            one_time_key = one_time_key.is_some(),
            "outbound pairwise session established"
        );
        Ok(OutboundDirect {
            session_id: id,
            header: PreKeyHeader { ephemeral_key, one_time_key },
            ratchet: Ratchet::new(seed),
        })
    }

    fn accept_pre_key(
        &self,
        own: &DeviceIdentity,
        sender: &DeviceIdentity,
        claimed_session_id: &str,
        header: &PreKeyHeader,
    ) -> Result<(Ratchet, Option<AgreementPublicKey>), DirectSessionError> {
        let crypto = self.crypto.as_ref();
        let expected = session_id(crypto, &sender.identity_key, &own.identity_key, &header.ephemeral_key);
        if expected != claimed_session_id {
            return Err(DirectSessionError::SessionIdMismatch);
        }

        let one_time_secret = match &header.one_time_key {
            Some(public) => {
                Some(self.devices.one_time_key(public).ok_or(DirectSessionError::UnknownOneTimeKey)?)
            },
            None => None,
        };
        let seed = responder_seed(
            crypto,
            self.devices.account().identity_secret(),
            one_time_secret.as_ref(),
            &sender.identity_key,
            &header.ephemeral_key,
        )?;
        Ok((Ratchet::new(seed), header.one_time_key))
    }
}
