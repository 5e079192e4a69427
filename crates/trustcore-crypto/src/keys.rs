//! Key and signature newtypes.
//!
//! Public values serialize as byte strings and display as lowercase hex.
//! Secret values never implement `Debug` output of their contents, never
//! serialize, and are zeroized on drop.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every symmetric key, public key and secret scalar (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature (64 bytes)
pub const SIGNATURE_SIZE: usize = 64;

macro_rules! byte_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Wrap raw bytes.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Parse from a slice, checking the length.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, crate::CryptoError> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    crate::CryptoError::InvalidKeyLength { expected: $len, actual: bytes.len() }
                })?;
                Ok(Self(array))
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Lowercase hex encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes = deserializer.deserialize_bytes(ByteVisitor)?;
                Self::from_slice(&bytes).map_err(de::Error::custom)
            }
        }
    };
}

/// Accepts both CBOR byte strings and integer sequences.
struct ByteVisitor;

impl<'de> de::Visitor<'de> for ByteVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte string")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(v)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(KEY_SIZE));
        while let Some(byte) = seq.next_element::<u8>()? {
            out.push(byte);
        }
        Ok(out)
    }
}

byte_newtype!(
    /// Ed25519 public key identifying a device's signing identity.
    SigningPublicKey,
    KEY_SIZE
);

byte_newtype!(
    /// X25519 public key used for key agreement.
    AgreementPublicKey,
    KEY_SIZE
);

byte_newtype!(
    /// Ed25519 signature.
    Signature,
    SIGNATURE_SIZE
);

/// Ed25519 secret seed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecret([u8; KEY_SIZE]);

impl SigningSecret {
    /// Wrap 32 bytes of caller-provided entropy as a signing seed.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(..)")
    }
}

/// X25519 secret scalar.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AgreementSecret([u8; KEY_SIZE]);

impl AgreementSecret {
    /// Wrap 32 bytes of caller-provided entropy as an agreement secret.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw scalar bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AgreementSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgreementSecret(..)")
    }
}

/// Output of an X25519 key agreement.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    pub(crate) fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw shared secret bytes. Feed into a KDF, never use directly as a key.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_hex_display() {
        let key = SigningPublicKey::from_bytes([0xAB; KEY_SIZE]);
        assert_eq!(key.to_string(), "ab".repeat(KEY_SIZE));
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let result = AgreementPublicKey::from_slice(&[0u8; 31]);
        assert!(matches!(
            result,
            Err(crate::CryptoError::InvalidKeyLength { expected: 32, actual: 31 })
        ));
    }

    #[test]
    fn signature_cbor_roundtrip() {
        let sig = Signature::from_bytes([7u8; SIGNATURE_SIZE]);
        let mut buf = Vec::new();
        ciborium::into_writer(&sig, &mut buf).unwrap();
        let decoded: Signature = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn secret_debug_hides_material() {
        let secret = SigningSecret::from_bytes([1u8; KEY_SIZE]);
        assert_eq!(format!("{secret:?}"), "SigningSecret(..)");
    }
}
