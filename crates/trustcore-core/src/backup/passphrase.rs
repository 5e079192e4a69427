//! Backup keys derived from a passphrase.

use serde::{Deserialize, Serialize};
use trustcore_crypto::{CryptoError, CryptoPrimitives, KEY_SIZE};
use zeroize::Zeroize;

use super::recovery_key::RecoveryKey;
use crate::{config::MIN_PASSPHRASE_ITERATIONS, env::Environment};

/// Bytes of entropy in a generated salt
const SALT_BYTES: usize = 16;

/// KDF parameters stored next to a passphrase-derived backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// PBKDF2 salt
    pub salt: String,
    /// PBKDF2 iteration count
    pub iterations: u32,
}

/// Key derived from a passphrase, with the parameters needed to derive it
/// again. The key is zeroized on drop.
#[derive(Debug, Clone)]
pub struct RecoveryKeyMaterial {
    /// Derived backup decryption key
    pub key: RecoveryKey,
    /// Salt and iteration count
    pub info: PassphraseInfo,
}

/// Derive a new backup key from `passphrase` with a fresh salt.
///
/// `iterations` below 2^20 are raised to 2^20.
pub fn derive_key_from_passphrase<E: Environment>(
    env: &E,
    crypto: &dyn CryptoPrimitives,
    passphrase: &str,
    iterations: u32,
) -> Result<RecoveryKeyMaterial, CryptoError> {
    let info = PassphraseInfo {
        salt: env.random_id(SALT_BYTES),
        iterations: effective_iterations(iterations),
    };
    let key = derive_key_with_info(crypto, passphrase, &info)?;
    Ok(RecoveryKeyMaterial { key, info })
}

fn effective_iterations(requested: u32) -> u32 {
    requested.max(MIN_PASSPHRASE_ITERATIONS)
}

/// Derive the backup key for known parameters.
pub fn derive_key_with_info(
    crypto: &dyn CryptoPrimitives,
    passphrase: &str,
    info: &PassphraseInfo,
) -> Result<RecoveryKey, CryptoError> {
    let mut raw = [0u8; KEY_SIZE];
    crypto.pbkdf2_sha256(passphrase.as_bytes(), info.salt.as_bytes(), info.iterations, &mut raw)?;
    let key = RecoveryKey::from_bytes(raw);
    raw.zeroize();
    Ok(key)
}
