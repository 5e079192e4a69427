//! Device identities and this device's own keys.
//!
//! [`DeviceKeyStore`] is the single writer of [`DeviceIdentity`] records. A
//! record is created the first time a peer's signed device keys are observed
//! and afterwards only its trust flag and stale flag ever change. Keys that
//! differ from the recorded ones are rejected, never swapped in.
//!
//! Trust transitions:
//!
//! ```text
//! Unknown --verification--> Verified
//! Unknown|Verified --block--> Blocked --unblock--> Unknown
//! ```

#![allow(clippy::disallowed_types, reason = "One-time key map is a short synchronous section")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use trustcore_crypto::{
    AgreementPublicKey, AgreementSecret, CryptoPrimitives, Signature, SigningPublicKey,
    SigningSecret,
};

use crate::{
    env::Environment,
    ids::{DeviceAddress, DeviceId, UserId},
    store::{CryptoStore, StoreError},
    transcript::Transcript,
};

/// Local trust decision for a peer device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// Keys observed but never verified
    #[default]
    Unknown,
    /// Keys confirmed through an interactive verification
    Verified,
    /// User refused this device; it never receives room keys
    Blocked,
}

/// A peer device's published keys plus local trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Owning user
    pub user_id: UserId,
    /// Device id
    pub device_id: DeviceId,
    /// Long-term key agreement key
    pub identity_key: AgreementPublicKey,
    /// Long-term signing key
    pub signing_key: SigningPublicKey,
    /// Local trust decision
    pub trust: TrustState,
    /// Device no longer listed by its owner's device list
    pub stale: bool,
}

impl DeviceIdentity {
    /// (user, device) address of this identity.
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.user_id.clone(), self.device_id.clone())
    }

    /// True if the user verified this device.
    pub fn is_verified(&self) -> bool {
        self.trust == TrustState::Verified
    }

    /// True if the user blocked this device.
    pub fn is_blocked(&self) -> bool {
        self.trust == TrustState::Blocked
    }
}

/// Device keys as published by their owner, self-signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeviceKeys {
    /// Owning user
    pub user_id: UserId,
    /// Device id
    pub device_id: DeviceId,
    /// Long-term key agreement key
    pub identity_key: AgreementPublicKey,
    /// Long-term signing key
    pub signing_key: SigningPublicKey,
    /// Signature by `signing_key` over the fields above
    pub signature: Signature,
}

impl SignedDeviceKeys {
    fn signed_bytes(
        user_id: &UserId,
        device_id: &DeviceId,
        identity_key: &AgreementPublicKey,
        signing_key: &SigningPublicKey,
    ) -> Vec<u8> {
        Transcript::new("trustcore.device_keys.v1")
            .field(user_id.as_str())
            .field(device_id.as_str())
            .field(identity_key.as_bytes())
            .field(signing_key.as_bytes())
            .finish()
    }

    /// Check the self-signature.
    pub fn verify(&self, crypto: &dyn CryptoPrimitives) -> Result<(), trustcore_crypto::CryptoError> {
        let message = Self::signed_bytes(
            &self.user_id,
            &self.device_id,
            &self.identity_key,
            &self.signing_key,
        );
        crypto.verify(&self.signing_key, &message, &self.signature)
    }

    /// (user, device) address these keys belong to.
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.user_id.clone(), self.device_id.clone())
    }
}

/// This device's long-term secrets.
pub struct LocalAccount {
    address: DeviceAddress,
    signing_secret: SigningSecret,
    signing_key: SigningPublicKey,
    identity_secret: AgreementSecret,
    identity_key: AgreementPublicKey,
}

impl LocalAccount {
    /// Fresh identity keys for a device.
    pub fn generate(
        env: &impl Environment,
        crypto: &dyn CryptoPrimitives,
        address: DeviceAddress,
    ) -> Self {
        Self::from_secrets(
            crypto,
            address,
            SigningSecret::from_bytes(env.random_key()),
            AgreementSecret::from_bytes(env.random_key()),
        )
    }

    /// Restore an account from its secrets.
    pub fn from_secrets(
        crypto: &dyn CryptoPrimitives,
        address: DeviceAddress,
        signing_secret: SigningSecret,
        identity_secret: AgreementSecret,
    ) -> Self {
        let signing_key = crypto.signing_public_key(&signing_secret);
        let identity_key = crypto.agreement_public_key(&identity_secret);
        Self { address, signing_secret, signing_key, identity_secret, identity_key }
    }

    /// This device's address.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Public signing key.
    pub fn signing_key(&self) -> SigningPublicKey {
        self.signing_key
    }

    /// Public identity (agreement) key.
    pub fn identity_key(&self) -> AgreementPublicKey {
        self.identity_key
    }

    pub(crate) fn identity_secret(&self) -> &AgreementSecret {
        &self.identity_secret
    }

    /// Sign with the device signing key.
    pub fn sign(&self, crypto: &dyn CryptoPrimitives, message: &[u8]) -> Signature {
        crypto.sign(&self.signing_secret, message)
    }

    /// Self-signed public keys for upload.
    pub fn device_keys(&self, crypto: &dyn CryptoPrimitives) -> SignedDeviceKeys {
        let message = SignedDeviceKeys::signed_bytes(
            &self.address.user_id,
            &self.address.device_id,
            &self.identity_key,
            &self.signing_key,
        );
        SignedDeviceKeys {
            user_id: self.address.user_id.clone(),
            device_id: self.address.device_id.clone(),
            identity_key: self.identity_key,
            signing_key: self.signing_key,
            signature: self.sign(crypto, &message),
        }
    }
}

impl std::fmt::Debug for LocalAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAccount")
            .field("address", &self.address)
            .field("signing_key", &self.signing_key)
            .field("identity_key", &self.identity_key)
            .finish_non_exhaustive()
    }
}

/// Errors from device key bookkeeping.
#[derive(Debug, Error)]
pub enum DeviceKeyError {
    /// Self-signature on published keys did not verify
    #[error("invalid self-signature on keys of {address}")]
    InvalidSignature {
        /// Device whose keys were rejected
        address: DeviceAddress,
    },

    /// Published keys differ from the ones already recorded
    #[error("keys of {address} changed; refusing to replace them")]
    KeysChanged {
        /// Device whose keys changed
        address: DeviceAddress,
    },

    /// No identity recorded for the device
    #[error("unknown device {0}")]
    UnknownDevice(DeviceAddress),

    /// Device is blocked and cannot become verified
    #[error("device {0} is blocked")]
    Blocked(DeviceAddress),

    /// Trust of this device itself cannot be changed
    #[error("cannot change trust of own device")]
    OwnDevice,

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of observing a device's published keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    /// First observation; recorded with [`TrustState::Unknown`]
    New,
    /// Keys match the existing record
    Unchanged,
}

/// Own account, one-time keys, and peer device records.
pub struct DeviceKeyStore<S: CryptoStore> {
    account: LocalAccount,
    store: S,
    crypto: Arc<dyn CryptoPrimitives>,
    one_time_keys: Mutex<BTreeMap<AgreementPublicKey, AgreementSecret>>,
}

impl<S: CryptoStore> DeviceKeyStore<S> {
    /// Wrap an account and a store.
    pub fn new(account: LocalAccount, store: S, crypto: Arc<dyn CryptoPrimitives>) -> Self {
        Self { account, store, crypto, one_time_keys: Mutex::new(BTreeMap::new()) }
    }

    /// This device's account.
    pub fn account(&self) -> &LocalAccount {
        &self.account
    }

    /// This device's address.
    pub fn own_address(&self) -> &DeviceAddress {
        self.account.address()
    }

    /// This device as an identity record. Always trusted.
    pub fn own_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            user_id: self.account.address.user_id.clone(),
            device_id: self.account.address.device_id.clone(),
            identity_key: self.account.identity_key,
            signing_key: self.account.signing_key,
            trust: TrustState::Verified,
            stale: false,
        }
    }

    /// Generate one-time keys for publication and keep their secrets.
    pub fn generate_one_time_keys(
        &self,
        env: &impl Environment,
        count: usize,
    ) -> Vec<AgreementPublicKey> {
        let mut keys = self.one_time_keys.lock().unwrap_or_else(PoisonError::into_inner);
        let mut published = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = AgreementSecret::from_bytes(env.random_key());
            let public = self.crypto.agreement_public_key(&secret);
            keys.insert(public, secret);
            published.push(public);
        }
        debug!(count, total = keys.len(), "generated one-time keys");
        published
    }

    /// Secret for a published one-time key, without consuming it.
    pub(crate) fn one_time_key(&self, public: &AgreementPublicKey) -> Option<AgreementSecret> {
        self.one_time_keys.lock().unwrap_or_else(PoisonError::into_inner).get(public).cloned()
    }

    /// Forget a one-time key once a session was established with it. Each
    /// key is usable exactly once.
    pub(crate) fn consume_one_time_key(&self, public: &AgreementPublicKey) -> bool {
        self.one_time_keys.lock().unwrap_or_else(PoisonError::into_inner).remove(public).is_some()
    }

    /// Unused one-time keys still held.
    pub fn one_time_key_count(&self) -> usize {
        self.one_time_keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Record a peer's published keys.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the self-signature does not verify
    /// - `KeysChanged` if a record exists with different keys
    pub fn receive_device_keys(&self, keys: &SignedDeviceKeys) -> Result<DeviceChange, DeviceKeyError> {
        let address = keys.address();
        if keys.verify(self.crypto.as_ref()).is_err() {
            warn!(device = %address, "rejected device keys with bad self-signature");
            return Err(DeviceKeyError::InvalidSignature { address });
        }

        if &address == self.own_address() {
            if keys.signing_key != self.account.signing_key
                || keys.identity_key != self.account.identity_key
            {
                warn!(device = %address, "server lists foreign keys for own device");
                return Err(DeviceKeyError::KeysChanged { address });
            }
            return Ok(DeviceChange::Unchanged);
        }

        match self.store.load_device(&address)? {
            None => {
                let identity = DeviceIdentity {
                    user_id: keys.user_id.clone(),
                    device_id: keys.device_id.clone(),
                    identity_key: keys.identity_key,
                    signing_key: keys.signing_key,
                    trust: TrustState::Unknown,
                    stale: false,
                };
                self.store.save_device(&identity)?;
                debug!(device = %address, "recorded new device");
                Ok(DeviceChange::New)
            },
            Some(existing)
                if existing.identity_key == keys.identity_key
                    && existing.signing_key == keys.signing_key =>
            {
                if existing.stale {
                    self.store.save_device(&DeviceIdentity { stale: false, ..existing })?;
                }
                Ok(DeviceChange::Unchanged)
            },
            Some(_) => {
                warn!(device = %address, "device keys changed; keeping recorded keys");
                Err(DeviceKeyError::KeysChanged { address })
            },
        }
    }

    /// Apply a user's full device list: record new devices, mark devices no
    /// longer listed as stale.
    ///
    /// Keys that fail validation are skipped and reported in the returned
    /// list; they do not stop the rest of the list from being applied.
    pub fn update_user_devices(
        &self,
        user_id: &UserId,
        listed: &[SignedDeviceKeys],
    ) -> Result<Vec<DeviceKeyError>, StoreError> {
        let mut rejected = Vec::new();
        for keys in listed.iter().filter(|k| &k.user_id == user_id) {
            match self.receive_device_keys(keys) {
                Ok(_) => {},
                Err(DeviceKeyError::Store(err)) => return Err(err),
                Err(err) => rejected.push(err),
            }
        }

        for device in self.store.load_user_devices(user_id)? {
            let still_listed = listed.iter().any(|k| k.device_id == device.device_id);
            if !still_listed && !device.stale {
                debug!(device = %device.address(), "device no longer listed, marking stale");
                self.store.save_device(&DeviceIdentity { stale: true, ..device })?;
            }
        }
        Ok(rejected)
    }

    /// Look up a device.
    pub fn device(&self, address: &DeviceAddress) -> Result<Option<DeviceIdentity>, StoreError> {
        if address == self.own_address() {
            return Ok(Some(self.own_identity()));
        }
        self.store.load_device(address)
    }

    /// All known devices of a user, excluding this device.
    pub fn user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceIdentity>, StoreError> {
        let own = self.own_address();
        let mut devices: Vec<_> = self
            .store
            .load_user_devices(user_id)?
            .into_iter()
            .filter(|d| d.address() != *own)
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    /// Find the device of `user_id` owning an identity key.
    pub fn device_by_identity_key(
        &self,
        user_id: &UserId,
        identity_key: &AgreementPublicKey,
    ) -> Result<Option<DeviceIdentity>, StoreError> {
        if user_id == &self.own_address().user_id && identity_key == &self.account.identity_key {
            return Ok(Some(self.own_identity()));
        }
        Ok(self
            .store
            .load_user_devices(user_id)?
            .into_iter()
            .find(|d| &d.identity_key == identity_key))
    }

    /// Mark a device verified. Only the verification engine calls this.
    ///
    /// A blocked device stays blocked until it is explicitly unblocked.
    pub(crate) fn mark_verified(&self, address: &DeviceAddress) -> Result<DeviceIdentity, DeviceKeyError> {
        if self.load_peer(address)?.trust == TrustState::Blocked {
            return Err(DeviceKeyError::Blocked(address.clone()));
        }
        let device = self.set_trust(address, TrustState::Verified)?;
        info!(device = %address, "device verified");
        Ok(device)
    }

    /// Block a device. Blocked devices never receive room keys.
    pub fn block(&self, address: &DeviceAddress) -> Result<DeviceIdentity, DeviceKeyError> {
        let device = self.set_trust(address, TrustState::Blocked)?;
        info!(device = %address, "device blocked");
        Ok(device)
    }

    /// Lift a block. The device returns to [`TrustState::Unknown`].
    pub fn unblock(&self, address: &DeviceAddress) -> Result<DeviceIdentity, DeviceKeyError> {
        let current = self.load_peer(address)?;
        if current.trust != TrustState::Blocked {
            return Ok(current);
        }
        let device = self.set_trust(address, TrustState::Unknown)?;
        info!(device = %address, "device unblocked");
        Ok(device)
    }

    fn load_peer(&self, address: &DeviceAddress) -> Result<DeviceIdentity, DeviceKeyError> {
        if address == self.own_address() {
            return Err(DeviceKeyError::OwnDevice);
        }
        self.store
            .load_device(address)?
            .ok_or_else(|| DeviceKeyError::UnknownDevice(address.clone()))
    }

    fn set_trust(&self, address: &DeviceAddress, trust: TrustState) -> Result<DeviceIdentity, DeviceKeyError> {
        let device = self.load_peer(address)?;
        if device.trust == trust {
            return Ok(device);
        }
        let updated = DeviceIdentity { trust, ..device };
        self.store.save_device(&updated)?;
        Ok(updated)
    }
}
