//! Server-side backup versions and their signed auth data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use trustcore_crypto::{AgreementPublicKey, CryptoPrimitives, Signature};

use super::passphrase::PassphraseInfo;
use crate::{
    devices::{DeviceKeyStore, LocalAccount},
    ids::{DeviceAddress, DeviceId},
    store::{CryptoStore, StoreError},
    transcript::Transcript,
};

/// Algorithm this crate reads and writes: ephemeral X25519 to the backup
/// key, HKDF-SHA256, XChaCha20-Poly1305.
pub const BACKUP_ALGORITHM: &str = "trustcore.backup.v1.x25519-hkdf-xchacha20poly1305";

/// Public half of a backup plus signatures vouching for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAuthData {
    /// Key sessions are encrypted to
    pub public_key: AgreementPublicKey,
    /// KDF parameters, if the key was derived from a passphrase
    pub passphrase: Option<PassphraseInfo>,
    /// Signatures by devices of the backup owner, keyed by device id
    pub signatures: BTreeMap<DeviceId, Signature>,
}

impl BackupAuthData {
    fn signed_bytes(&self, algorithm: &str) -> Vec<u8> {
        let (salt, iterations) = match &self.passphrase {
            Some(info) => (info.salt.as_str(), info.iterations),
            None => ("", 0),
        };
        Transcript::new("trustcore.backup_auth.v1")
            .field(algorithm)
            .field(self.public_key.as_bytes())
            .field(salt)
            .u32(iterations)
            .finish()
    }

    /// Auth data for a new version, signed by this device.
    pub fn signed(
        crypto: &dyn CryptoPrimitives,
        account: &LocalAccount,
        public_key: AgreementPublicKey,
        passphrase: Option<PassphraseInfo>,
    ) -> Self {
        let mut auth = Self { public_key, passphrase, signatures: BTreeMap::new() };
        let signature = account.sign(crypto, &auth.signed_bytes(BACKUP_ALGORITHM));
        auth.signatures.insert(account.address().device_id.clone(), signature);
        auth
    }

    /// Whether this device or one of its owner's verified devices signed
    /// the auth data.
    pub fn is_trusted<S: CryptoStore>(
        &self,
        crypto: &dyn CryptoPrimitives,
        devices: &DeviceKeyStore<S>,
        algorithm: &str,
    ) -> Result<bool, StoreError> {
        let signed = self.signed_bytes(algorithm);
        let own = devices.own_address();
        for (device_id, signature) in &self.signatures {
            let address = DeviceAddress::new(own.user_id.clone(), device_id.clone());
            let Some(device) = devices.device(&address)? else { continue };
            if &address != own && !device.is_verified() {
                continue;
            }
            if crypto.verify(&device.signing_key, &signed, signature).is_ok() {
                return Ok(true);
            }
            debug!(device = %address, "backup signature does not verify");
        }
        Ok(false)
    }
}

/// A backup version as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVersion {
    /// Server-assigned version id
    pub version: String,
    /// Encryption algorithm
    pub algorithm: String,
    /// Public key and signatures
    pub auth_data: BackupAuthData,
}

/// A backup version to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBackupVersion {
    /// Encryption algorithm
    pub algorithm: String,
    /// Public key and signatures
    pub auth_data: BackupAuthData,
}
