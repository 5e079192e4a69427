//! The primitive capability trait and its RustCrypto implementation.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::{
    CryptoError,
    keys::{
        AgreementPublicKey, AgreementSecret, KEY_SIZE, SharedSecret, Signature, SigningPublicKey,
        SigningSecret,
    },
};

type HmacSha256 = Hmac<Sha256>;

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Maximum HKDF-SHA256 output (255 * 32 bytes)
const HKDF_MAX_OUTPUT: usize = 255 * 32;

/// Stateless cryptographic operations consumed by every trustcore component.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - Every method is deterministic in its inputs
/// - `aead_decrypt` authenticates both ciphertext and `aad` before returning
///   any plaintext
/// - `verify` is strict: a signature either verifies or the call errors
/// - `key_agreement` rejects non-contributory (all-zero) results
pub trait CryptoPrimitives: Send + Sync {
    /// Authenticated encryption. Returns ciphertext with the tag appended.
    fn aead_encrypt(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Authenticated decryption.
    fn aead_decrypt(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Public half of a signing seed.
    fn signing_public_key(&self, secret: &SigningSecret) -> SigningPublicKey;

    /// Sign a message.
    fn sign(&self, secret: &SigningSecret, message: &[u8]) -> Signature;

    /// Verify a signature.
    fn verify(
        &self,
        public: &SigningPublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError>;

    /// Public half of an agreement secret.
    fn agreement_public_key(&self, secret: &AgreementSecret) -> AgreementPublicKey;

    /// Diffie-Hellman key agreement.
    fn key_agreement(
        &self,
        secret: &AgreementSecret,
        their_public: &AgreementPublicKey,
    ) -> Result<SharedSecret, CryptoError>;

    /// HKDF-SHA256 extract-and-expand into `output`.
    fn hkdf_sha256(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptoError>;

    /// PBKDF2-HMAC-SHA256 into `output`.
    fn pbkdf2_sha256(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: u32,
        output: &mut [u8],
    ) -> Result<(), CryptoError>;

    /// HMAC-SHA256.
    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> [u8; 32];

    /// SHA-256.
    fn sha256(&self, data: &[u8]) -> [u8; 32];
}

/// Default primitive set backed by RustCrypto and dalek.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoPrimitives;

impl RustCryptoPrimitives {
    /// Create the primitive set.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoPrimitives for RustCryptoPrimitives {
    fn aead_encrypt(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(key.into());
        cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn aead_decrypt(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed {
                reason: format!("ciphertext shorter than tag: {} bytes", ciphertext.len()),
            });
        }

        let cipher = XChaCha20Poly1305::new(key.into());
        cipher.decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad }).map_err(
            |_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() },
        )
    }

    fn signing_public_key(&self, secret: &SigningSecret) -> SigningPublicKey {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        SigningPublicKey::from_bytes(signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, secret: &SigningSecret, message: &[u8]) -> Signature {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        Signature::from_bytes(signing_key.sign(message).to_bytes())
    }

    fn verify(
        &self,
        public: &SigningPublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(public.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

        verifying_key
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    fn agreement_public_key(&self, secret: &AgreementSecret) -> AgreementPublicKey {
        let secret = x25519_dalek::StaticSecret::from(*secret.as_bytes());
        AgreementPublicKey::from_bytes(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    fn key_agreement(
        &self,
        secret: &AgreementSecret,
        their_public: &AgreementPublicKey,
    ) -> Result<SharedSecret, CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(*secret.as_bytes());
        let public = x25519_dalek::PublicKey::from(*their_public.as_bytes());
        let shared = secret.diffie_hellman(&public);

        if !shared.was_contributory() {
            return Err(CryptoError::WeakKeyAgreement);
        }

        Ok(SharedSecret::new(shared.to_bytes()))
    }

    fn hkdf_sha256(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptoError> {
        if output.is_empty() || output.len() > HKDF_MAX_OUTPUT {
            return Err(CryptoError::InvalidOutputLength { length: output.len() });
        }

        let salt = if salt.is_empty() { None } else { Some(salt) };
        let hkdf = Hkdf::<Sha256>::new(salt, ikm);
        hkdf.expand(info, output)
            .map_err(|_| CryptoError::InvalidOutputLength { length: output.len() })
    }

    fn pbkdf2_sha256(
        &self,
        passphrase: &[u8],
        salt: &[u8],
        iterations: u32,
        output: &mut [u8],
    ) -> Result<(), CryptoError> {
        if output.is_empty() || iterations == 0 {
            return Err(CryptoError::InvalidOutputLength { length: output.len() });
        }

        pbkdf2::pbkdf2::<HmacSha256>(passphrase, salt, iterations, output)
            .map_err(|_| CryptoError::InvalidOutputLength { length: output.len() })
    }

    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(message);
        mac.finalize().into_bytes().into()
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> RustCryptoPrimitives {
        RustCryptoPrimitives::new()
    }

    #[test]
    fn aead_roundtrip_with_aad() {
        let key = [0x11; KEY_SIZE];
        let nonce = [0x22; NONCE_SIZE];

        let ciphertext = crypto().aead_encrypt(&key, &nonce, b"header", b"hello").unwrap();
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);

        let plaintext = crypto().aead_decrypt(&key, &nonce, b"header", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn hmac_matches_rfc4231_vector() {
        let mac = crypto().hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(hex::encode(mac), "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");

        // Keys longer than the block size are hashed first.
        let long_key = [0xaa; 131];
        assert_ne!(crypto().hmac_sha256(&long_key, b"x"), crypto().hmac_sha256(&long_key[..64], b"x"));
    }

    #[test]
    fn aead_rejects_wrong_aad() {
        let key = [0x11; KEY_SIZE];
        let nonce = [0x22; NONCE_SIZE];

        let ciphertext = crypto().aead_encrypt(&key, &nonce, b"header", b"hello").unwrap();
        let result = crypto().aead_decrypt(&key, &nonce, b"other", &ciphertext);

        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn aead_rejects_truncated_ciphertext() {
        let result = crypto().aead_decrypt(&[0; KEY_SIZE], &[0; NONCE_SIZE], b"", &[0u8; 3]);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn sign_verify_roundtrip() {
        let secret = SigningSecret::from_bytes([0x42; KEY_SIZE]);
        let public = crypto().signing_public_key(&secret);

        let signature = crypto().sign(&secret, b"message");
        assert!(crypto().verify(&public, b"message", &signature).is_ok());
        assert_eq!(
            crypto().verify(&public, b"tampered", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn key_agreement_is_symmetric() {
        let alice = AgreementSecret::from_bytes([0x01; KEY_SIZE]);
        let bob = AgreementSecret::from_bytes([0x02; KEY_SIZE]);

        let alice_public = crypto().agreement_public_key(&alice);
        let bob_public = crypto().agreement_public_key(&bob);

        let ab = crypto().key_agreement(&alice, &bob_public).unwrap();
        let ba = crypto().key_agreement(&bob, &alice_public).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn key_agreement_rejects_zero_point() {
        let secret = AgreementSecret::from_bytes([0x01; KEY_SIZE]);
        let zero = AgreementPublicKey::from_bytes([0u8; KEY_SIZE]);

        let result = crypto().key_agreement(&secret, &zero);
        assert!(matches!(result, Err(CryptoError::WeakKeyAgreement)));
    }

    #[test]
    fn hkdf_rejects_empty_output() {
        let mut out = [];
        let result = crypto().hkdf_sha256(b"ikm", b"", b"info", &mut out);
        assert!(matches!(result, Err(CryptoError::InvalidOutputLength { length: 0 })));
    }

    #[test]
    fn pbkdf2_is_deterministic() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        crypto().pbkdf2_sha256(b"pass", b"salt", 10, &mut a).unwrap();
        crypto().pbkdf2_sha256(b"pass", b"salt", 10, &mut b).unwrap();
        assert_eq!(a, b);

        crypto().pbkdf2_sha256(b"pass", b"pepper", 10, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_known_vector() {
        let digest = crypto().sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
