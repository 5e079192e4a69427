//! Per-session backup encryption.
//!
//! Each session is encrypted on its own: a fresh ephemeral X25519 key agrees
//! with the backup public key, HKDF turns the shared secret into an AEAD key,
//! and the exported session is sealed with the room and session id as
//! associated data. Only the holder of the backup secret can open it.

use serde::{Deserialize, Serialize};
use trustcore_crypto::{
    AgreementPublicKey, AgreementSecret, CryptoError, CryptoPrimitives, KEY_SIZE, NONCE_SIZE,
};
use zeroize::Zeroizing;

use super::error::BackupError;
use crate::{
    codec::{self, CodecError},
    env::Environment,
    group::ExportedRoomKey,
    ids::RoomId,
    transcript::Transcript,
};

/// Sealed session payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// Ephemeral public key of the sender
    pub ephemeral: AgreementPublicKey,
    /// AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Encrypted CBOR of the exported session
    pub ciphertext: Vec<u8>,
}

/// One backed-up session as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// Room of the session
    pub room_id: RoomId,
    /// Session id
    pub session_id: String,
    /// First message index the backed-up copy can decrypt
    pub first_message_index: u32,
    /// Sealed session
    pub session_data: EncryptedSessionData,
}

fn aead_key(
    crypto: &dyn CryptoPrimitives,
    shared: &[u8],
    ephemeral: &AgreementPublicKey,
    backup_key: &AgreementPublicKey,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let info = Transcript::new("trustcore.backup_key.v1")
        .field(ephemeral.as_bytes())
        .field(backup_key.as_bytes())
        .finish();
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    crypto.hkdf_sha256(shared, &[], &info, &mut key[..])?;
    Ok(key)
}

fn associated_data(room_id: &RoomId, session_id: &str) -> Vec<u8> {
    Transcript::new("trustcore.backup_session.v1").field(room_id.as_str()).field(session_id).finish()
}

/// Seal an exported session to the backup public key.
pub(crate) fn encrypt_session<E: Environment>(
    env: &E,
    crypto: &dyn CryptoPrimitives,
    backup_key: &AgreementPublicKey,
    export: &ExportedRoomKey,
) -> Result<BackedUpRoomKey, BackupError> {
    let ephemeral_secret = AgreementSecret::from_bytes(env.random_key());
    let ephemeral = crypto.agreement_public_key(&ephemeral_secret);
    let shared = crypto.key_agreement(&ephemeral_secret, backup_key)?;
    let key = aead_key(crypto, shared.as_bytes(), &ephemeral, backup_key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    env.random_bytes(&mut nonce);
    let plaintext = Zeroizing::new(codec::encode(export)?);
    let ciphertext = crypto.aead_encrypt(
        &key,
        &nonce,
        &associated_data(&export.room_id, &export.session_id),
        &plaintext,
    )?;

    Ok(BackedUpRoomKey {
        room_id: export.room_id.clone(),
        session_id: export.session_id.clone(),
        first_message_index: export.first_known_index(),
        session_data: EncryptedSessionData { ephemeral, nonce, ciphertext },
    })
}

/// Open a backed-up session with the backup secret.
///
/// The room and session id on the envelope are authenticated, so an entry
/// moved to another slot fails to open.
pub(crate) fn decrypt_session(
    crypto: &dyn CryptoPrimitives,
    backup_secret: &AgreementSecret,
    entry: &BackedUpRoomKey,
) -> Result<ExportedRoomKey, BackupError> {
    let backup_key = crypto.agreement_public_key(backup_secret);
    let data = &entry.session_data;
    let shared = crypto.key_agreement(backup_secret, &data.ephemeral)?;
    let key = aead_key(crypto, shared.as_bytes(), &data.ephemeral, &backup_key)?;
    let plaintext = Zeroizing::new(crypto.aead_decrypt(
        &key,
        &data.nonce,
        &associated_data(&entry.room_id, &entry.session_id),
        &data.ciphertext,
    )?);
    let export: ExportedRoomKey = codec::decode(&plaintext)?;
    if export.room_id != entry.room_id || export.session_id != entry.session_id {
        return Err(CodecError::Decode("session does not match its envelope".into()).into());
    }
    Ok(export)
}

#[cfg(test)]
mod tests {
    use trustcore_crypto::{RustCryptoPrimitives, SigningPublicKey};

    use super::*;
    use crate::{env::test_utils::MockEnv, ratchet::RatchetSnapshot};

    fn export(room: &str, session_byte: u8) -> ExportedRoomKey {
        let signing_key = SigningPublicKey::from_bytes([session_byte; 32]);
        ExportedRoomKey {
            room_id: RoomId::from(room),
            sender_key: AgreementPublicKey::from_bytes([9; 32]),
            session_id: hex::encode(signing_key.as_bytes()),
            session_key: RatchetSnapshot { index: 4, chain_key: [session_byte; 32] },
            signing_key,
            sender_claimed_signing_key: None,
        }
    }

    fn backup_secret(env: &MockEnv) -> AgreementSecret {
        AgreementSecret::from_bytes(env.random_key())
    }

    #[test]
    fn sealed_session_opens_with_backup_secret() {
        let env = MockEnv::with_seed(1);
        let crypto = RustCryptoPrimitives::new();
        let secret = backup_secret(&env);
        let public = crypto.agreement_public_key(&secret);

        let original = export("!room", 5);
        let sealed = encrypt_session(&env, &crypto, &public, &original).unwrap();
        assert_eq!(sealed.first_message_index, 4);
        assert_eq!(decrypt_session(&crypto, &secret, &sealed).unwrap(), original);
    }

    #[test]
    fn wrong_secret_cannot_open() {
        let env = MockEnv::with_seed(2);
        let crypto = RustCryptoPrimitives::new();
        let secret = backup_secret(&env);
        let other = backup_secret(&env);
        let public = crypto.agreement_public_key(&secret);

        let sealed = encrypt_session(&env, &crypto, &public, &export("!room", 5)).unwrap();
        assert!(matches!(decrypt_session(&crypto, &other, &sealed), Err(BackupError::Crypto(_))));
    }

    #[test]
    fn moved_entry_cannot_open() {
        let env = MockEnv::with_seed(3);
        let crypto = RustCryptoPrimitives::new();
        let secret = backup_secret(&env);
        let public = crypto.agreement_public_key(&secret);

        let mut sealed = encrypt_session(&env, &crypto, &public, &export("!room", 5)).unwrap();
        sealed.room_id = RoomId::from("!elsewhere");
        assert!(decrypt_session(&crypto, &secret, &sealed).is_err());
    }

    #[test]
    fn each_seal_uses_a_fresh_ephemeral_key() {
        let env = MockEnv::with_seed(4);
        let crypto = RustCryptoPrimitives::new();
        let public = crypto.agreement_public_key(&backup_secret(&env));
        let session = export("!room", 5);

        let a = encrypt_session(&env, &crypto, &public, &session).unwrap();
        let b = encrypt_session(&env, &crypto, &public, &session).unwrap();
        assert_ne!(a.session_data.ephemeral, b.session_data.ephemeral);
        assert_ne!(a.session_data.ciphertext, b.session_data.ciphertext);
    }
}
