//! Trustcore Cryptographic Primitives
//!
//! Stateless cryptographic building blocks consumed by `trustcore-core`. The
//! core never calls a cipher, curve or hash directly; it goes through the
//! [`CryptoPrimitives`] trait so that a platform can supply its own vetted
//! implementation. [`RustCryptoPrimitives`] is the default implementation
//! backed by the RustCrypto and dalek crates.
//!
//! All operations are pure. Randomness is never drawn here: callers generate
//! secret material from their environment's entropy source and pass it in,
//! which keeps every operation reproducible under a seeded simulation.
//!
//! # Primitive Set
//!
//! ```text
//! AEAD            XChaCha20-Poly1305 (32-byte key, 24-byte nonce)
//! Signatures      Ed25519
//! Key agreement   X25519
//! KDF             HKDF-SHA256, PBKDF2-HMAC-SHA256
//! MAC / hash      HMAC-SHA256, SHA-256
//! ```
//!
//! # Security
//!
//! - Secret keys are zeroized on drop
//! - Key agreement rejects all-zero shared secrets (low-order points)
//! - Signature verification is strict (rejects malleable encodings)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod keys;
mod primitives;

pub use error::CryptoError;
pub use keys::{
    AgreementPublicKey, AgreementSecret, KEY_SIZE, SIGNATURE_SIZE, SharedSecret, Signature,
    SigningPublicKey, SigningSecret,
};
pub use primitives::{CryptoPrimitives, NONCE_SIZE, RustCryptoPrimitives, TAG_SIZE};
