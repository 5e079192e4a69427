//! Forward-secure symmetric ratchet.
//!
//! Shared by group sessions (one chain per outbound session, forked by every
//! recipient) and pairwise sessions (one chain per direction).
//!
//! # Security Properties
//!
//! - Forward Secrecy: the chain key is overwritten on every advance
//! - Key Uniqueness: each index yields a distinct message key
//! - Determinism: the same snapshot always yields the same key sequence

use serde::{Deserialize, Serialize};
use thiserror::Error;
use trustcore_crypto::{CryptoError, CryptoPrimitives, KEY_SIZE, NONCE_SIZE};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// HKDF info expanding a message key into AEAD key and nonce prefix
const MESSAGE_EXPAND_INFO: &[u8] = b"TRUSTCORE_MESSAGE_KEYS";

/// Bytes of the nonce filled from the message index
const NONCE_INDEX_SIZE: usize = 4;

/// Bytes of the nonce filled by the caller's randomness
pub(crate) const NONCE_RANDOM_SIZE: usize = NONCE_SIZE - NONCE_INDEX_SIZE;

/// Errors from ratchet positioning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RatchetError {
    /// Requested index precedes what this ratchet can still derive
    #[error("index {requested} already passed (ratchet at {current})")]
    IndexPassed {
        /// Current ratchet index
        current: u32,
        /// Requested index
        requested: u32,
    },

    /// Requested index is further ahead than the skip limit
    #[error("index {requested} too far ahead of {current} (limit {limit})")]
    TooFarAhead {
        /// Current ratchet index
        current: u32,
        /// Requested index
        requested: u32,
        /// Maximum allowed skip
        limit: u32,
    },

    /// Index counter would overflow
    #[error("ratchet index overflow at {current}")]
    IndexOverflow {
        /// Index when overflow was detected
        current: u32,
    },
}

/// Serializable ratchet position.
///
/// This is what a session key share carries: whoever holds it can derive
/// every message key from `index` onwards and none before.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetSnapshot {
    /// Index of the next message key this snapshot derives
    pub index: u32,
    /// Chain key at `index`
    pub chain_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for RatchetSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSnapshot").field("index", &self.index).finish_non_exhaustive()
    }
}

/// A message key derived from the ratchet.
///
/// Used for exactly one message and then dropped.
pub(crate) struct MessageKey {
    key: [u8; KEY_SIZE],
    index: u32,
}

impl MessageKey {
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Seal `plaintext` under this key.
    ///
    /// The nonce is the big-endian index followed by caller-provided random
    /// bytes, and is returned alongside the ciphertext.
    pub(crate) fn seal(
        &self,
        crypto: &dyn CryptoPrimitives,
        random_suffix: [u8; NONCE_RANDOM_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_INDEX_SIZE].copy_from_slice(&self.index.to_be_bytes());
        nonce[NONCE_INDEX_SIZE..].copy_from_slice(&random_suffix);

        let mut aead_key = self.expand(crypto)?;
        let sealed = crypto.aead_encrypt(&aead_key, &nonce, aad, plaintext);
        aead_key.zeroize();
        Ok((nonce, sealed?))
    }

    /// Open a ciphertext produced by [`Self::seal`].
    pub(crate) fn open(
        &self,
        crypto: &dyn CryptoPrimitives,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if nonce[..NONCE_INDEX_SIZE] != self.index.to_be_bytes() {
            return Err(CryptoError::DecryptionFailed {
                reason: "nonce does not match message index".to_string(),
            });
        }

        let mut aead_key = self.expand(crypto)?;
        let opened = crypto.aead_decrypt(&aead_key, nonce, aad, ciphertext);
        aead_key.zeroize();
        opened
    }

    fn expand(&self, crypto: &dyn CryptoPrimitives) -> Result<[u8; KEY_SIZE], CryptoError> {
        let mut out = [0u8; KEY_SIZE];
        crypto.hkdf_sha256(&self.key, &[], MESSAGE_EXPAND_INFO, &mut out)?;
        Ok(out)
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure symmetric ratchet.
///
/// Each [`advance()`](Self::advance) call derives the message key for the
/// current index, derives the next chain key, and overwrites the old one.
pub(crate) struct Ratchet {
    chain_key: [u8; KEY_SIZE],
    index: u32,
}

impl Ratchet {
    /// Fresh ratchet at index 0.
    pub(crate) fn new(seed: [u8; KEY_SIZE]) -> Self {
        Self { chain_key: seed, index: 0 }
    }

    /// Resume from a snapshot.
    pub(crate) fn from_snapshot(snapshot: &RatchetSnapshot) -> Self {
        Self { chain_key: snapshot.chain_key, index: snapshot.index }
    }

    /// Current position. The next `advance` derives the key for this index.
    pub(crate) fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot { index: self.index, chain_key: self.chain_key }
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Derive the key for the current index and step forward.
    pub(crate) fn advance(&mut self, crypto: &dyn CryptoPrimitives) -> Result<MessageKey, RatchetError> {
        if self.index == u32::MAX {
            return Err(RatchetError::IndexOverflow { current: self.index });
        }

        let message_key = crypto.hmac_sha256(&self.chain_key, MESSAGE_LABEL);
        let next_chain_key = crypto.hmac_sha256(&self.chain_key, CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current = self.index;
        self.index += 1;

        Ok(MessageKey { key: message_key, index: current })
    }

    /// Skip forward and derive the key for `target`.
    ///
    /// Intermediate keys are discarded. Fails without moving if `target` was
    /// already passed or lies more than `limit` steps ahead.
    pub(crate) fn advance_to(
        &mut self,
        crypto: &dyn CryptoPrimitives,
        target: u32,
        limit: u32,
    ) -> Result<MessageKey, RatchetError> {
        if target < self.index {
            return Err(RatchetError::IndexPassed { current: self.index, requested: target });
        }

        if target - self.index > limit {
            return Err(RatchetError::TooFarAhead { current: self.index, requested: target, limit });
        }

        while self.index < target {
            drop(self.advance(crypto)?);
        }
        self.advance(crypto)
    }
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use trustcore_crypto::RustCryptoPrimitives;

    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    #[test]
    fn advance_increments_index() {
        let crypto = RustCryptoPrimitives::new();
        let mut ratchet = Ratchet::new(test_seed());

        let key0 = ratchet.advance(&crypto).unwrap();
        assert_eq!(key0.index(), 0);
        assert_eq!(ratchet.index(), 1);

        let key1 = ratchet.advance(&crypto).unwrap();
        assert_eq!(key1.index(), 1);
        assert_ne!(key0.key, key1.key, "keys must be unique");
    }

    #[test]
    fn snapshot_resumes_same_sequence() {
        let crypto = RustCryptoPrimitives::new();
        let mut original = Ratchet::new(test_seed());
        original.advance(&crypto).unwrap();

        let mut fork = Ratchet::from_snapshot(&original.snapshot());
        for _ in 0..5 {
            let a = original.advance(&crypto).unwrap();
            let b = fork.advance(&crypto).unwrap();
            assert_eq!(a.key, b.key);
            assert_eq!(a.index(), b.index());
        }
    }

    #[test]
    fn advance_to_matches_sequential_advance() {
        let crypto = RustCryptoPrimitives::new();
        let mut sequential = Ratchet::new(test_seed());
        let mut expected = None;
        for _ in 0..=7 {
            expected = Some(sequential.advance(&crypto).unwrap());
        }

        let mut skipping = Ratchet::new(test_seed());
        let key = skipping.advance_to(&crypto, 7, 100).unwrap();
        assert_eq!(key.index(), 7);
        assert_eq!(Some(key.key), expected.map(|k| k.key));
        assert_eq!(skipping.index(), 8);
    }

    #[test]
    fn advance_to_rejects_passed_index() {
        let crypto = RustCryptoPrimitives::new();
        let mut ratchet = Ratchet::new(test_seed());
        ratchet.advance_to(&crypto, 3, 100).unwrap();

        let result = ratchet.advance_to(&crypto, 2, 100);
        assert!(matches!(result, Err(RatchetError::IndexPassed { current: 4, requested: 2 })));
    }

    #[test]
    fn advance_to_rejects_large_skip_without_moving() {
        let crypto = RustCryptoPrimitives::new();
        let mut ratchet = Ratchet::new(test_seed());

        let result = ratchet.advance_to(&crypto, 50, 10);
        assert!(matches!(result, Err(RatchetError::TooFarAhead { .. })));
        assert_eq!(ratchet.index(), 0);
    }

    #[test]
    fn seal_then_open_with_forked_key() {
        let crypto = RustCryptoPrimitives::new();
        let mut sender = Ratchet::new(test_seed());
        let snapshot = sender.snapshot();

        let key = sender.advance(&crypto).unwrap();
        let (nonce, ciphertext) = key.seal(&crypto, [7u8; NONCE_RANDOM_SIZE], b"aad", b"hi").unwrap();

        let mut receiver = Ratchet::from_snapshot(&snapshot);
        let key = receiver.advance_to(&crypto, 0, 10).unwrap();
        assert_eq!(key.open(&crypto, &nonce, b"aad", &ciphertext).unwrap(), b"hi");

        let tampered = key.open(&crypto, &nonce, b"other", &ciphertext);
        assert!(matches!(tampered, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn open_rejects_nonce_for_other_index() {
        let crypto = RustCryptoPrimitives::new();
        let mut ratchet = Ratchet::new(test_seed());
        let key0 = ratchet.advance(&crypto).unwrap();
        let key1 = ratchet.advance(&crypto).unwrap();

        let (nonce, ciphertext) = key0.seal(&crypto, [0u8; NONCE_RANDOM_SIZE], b"", b"x").unwrap();
        assert!(key1.open(&crypto, &nonce, b"", &ciphertext).is_err());
    }
}
