//! Short authentication string derivation.
//!
//! # Protocol
//!
//! ```text
//! accepter:  commitment = hex(SHA-256(accepter_key || canonical_start))
//! both:      secret     = X25519(own ephemeral, their ephemeral)
//!            sas_bytes  = HKDF(secret, info = transcript(starter, accepter, txn))[..6]
//!            mac_key    = HKDF(secret, info = transcript(sender, receiver, txn, key_id))
//!            mac        = hex(HMAC-SHA256(mac_key, input))
//! ```
//!
//! The commitment binds the accepter to its ephemeral key before it sees the
//! starter's, so neither side can grind for a colliding short code.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use trustcore_crypto::{AgreementPublicKey, CryptoError, CryptoPrimitives, SharedSecret, SigningPublicKey};

use crate::{
    ids::{DeviceAddress, DeviceId},
    transcript::Transcript,
};

/// Number of derived short code bytes
const SAS_BYTES: usize = 6;

/// Key id under which the list of MACed key ids is itself MACed
pub(crate) const KEY_IDS_MAC_ID: &str = "KEY_IDS";

/// How a short code is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SasMode {
    /// Three four-digit numbers
    Decimal,
    /// Seven emoji
    Emoji,
}

impl SasMode {
    /// Every mode this client can show.
    pub const ALL: [Self; 2] = [Self::Decimal, Self::Emoji];

    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decimal => "decimal",
            Self::Emoji => "emoji",
        }
    }

    fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == value)
    }
}

impl Serialize for SasMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SasMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_wire(&value).ok_or_else(|| serde::de::Error::custom(format!("unknown sas mode {value}")))
    }
}

/// Deserialize a mode list, dropping modes this client does not know.
pub(crate) fn known_sas_modes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SasMode>, D::Error> {
    let values = Vec::<String>::deserialize(deserializer)?;
    Ok(values.iter().filter_map(|v| SasMode::from_wire(v)).collect())
}

/// One emoji of the short code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SasEmoji {
    /// The emoji
    pub symbol: &'static str,
    /// English name shown next to it
    pub description: &'static str,
}

const fn emoji(symbol: &'static str, description: &'static str) -> SasEmoji {
    SasEmoji { symbol, description }
}

/// Emoji table indexed by 6-bit values.
pub const SAS_EMOJI: [SasEmoji; 64] = [
    emoji("🐶", "Dog"),
    emoji("🐱", "Cat"),
    emoji("🦁", "Lion"),
    emoji("🐎", "Horse"),
    emoji("🦄", "Unicorn"),
    emoji("🐷", "Pig"),
    emoji("🐘", "Elephant"),
    emoji("🐰", "Rabbit"),
    emoji("🐼", "Panda"),
    emoji("🐓", "Rooster"),
    emoji("🐧", "Penguin"),
    emoji("🐢", "Turtle"),
    emoji("🐟", "Fish"),
    emoji("🐙", "Octopus"),
    emoji("🦋", "Butterfly"),
    emoji("🌷", "Flower"),
    emoji("🌳", "Tree"),
    emoji("🌵", "Cactus"),
    emoji("🍄", "Mushroom"),
    emoji("🌏", "Globe"),
    emoji("🌙", "Moon"),
    emoji("☁️", "Cloud"),
    emoji("🔥", "Fire"),
    emoji("🍌", "Banana"),
    emoji("🍎", "Apple"),
    emoji("🍓", "Strawberry"),
    emoji("🌽", "Corn"),
    emoji("🍕", "Pizza"),
    emoji("🎂", "Cake"),
    emoji("❤️", "Heart"),
    emoji("😀", "Smiley"),
    emoji("🤖", "Robot"),
    emoji("🎩", "Hat"),
    emoji("👓", "Glasses"),
    emoji("🔧", "Spanner"),
    emoji("🎅", "Santa"),
    emoji("👍", "Thumbs Up"),
    emoji("☂️", "Umbrella"),
    emoji("⌛", "Hourglass"),
    emoji("⏰", "Clock"),
    emoji("🎁", "Gift"),
    emoji("💡", "Light Bulb"),
    emoji("📕", "Book"),
    emoji("✏️", "Pencil"),
    emoji("📎", "Paperclip"),
    emoji("✂️", "Scissors"),
    emoji("🔒", "Lock"),
    emoji("🔑", "Key"),
    emoji("🔨", "Hammer"),
    emoji("☎️", "Telephone"),
    emoji("🏁", "Flag"),
    emoji("🚂", "Train"),
    emoji("🚲", "Bicycle"),
    emoji("✈️", "Aeroplane"),
    emoji("🚀", "Rocket"),
    emoji("🏆", "Trophy"),
    emoji("⚽", "Ball"),
    emoji("🎸", "Guitar"),
    emoji("🎺", "Trumpet"),
    emoji("🔔", "Bell"),
    emoji("⚓", "Anchor"),
    emoji("🎧", "Headphones"),
    emoji("📁", "Folder"),
    emoji("📌", "Pin"),
];

/// Short code both users compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCode {
    bytes: [u8; SAS_BYTES],
}

impl ShortCode {
    /// Three numbers in 1000..=9191 from the first 39 bits.
    pub fn decimals(&self) -> [u16; 3] {
        let b = self.bytes.map(u16::from);
        [
            ((b[0] << 5) | (b[1] >> 3)) + 1000,
            (((b[1] & 0x7) << 10) | (b[2] << 2) | (b[3] >> 6)) + 1000,
            (((b[3] & 0x3f) << 7) | (b[4] >> 1)) + 1000,
        ]
    }

    /// Seven emoji from the first 42 bits.
    pub fn emoji(&self) -> [SasEmoji; 7] {
        let mut bits = [0u8; 8];
        bits[2..].copy_from_slice(&self.bytes);
        let value = u64::from_be_bytes(bits);
        std::array::from_fn(|i| SAS_EMOJI[((value >> (42 - 6 * i)) & 0x3f) as usize])
    }
}

/// One side of a SAS exchange.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SasParty<'a> {
    pub address: &'a DeviceAddress,
    pub key: &'a AgreementPublicKey,
}

pub(crate) fn commitment(
    crypto: &dyn CryptoPrimitives,
    accepter_key: &AgreementPublicKey,
    canonical_start: &[u8],
) -> String {
    let mut input = Vec::with_capacity(accepter_key.as_bytes().len() + canonical_start.len());
    input.extend_from_slice(accepter_key.as_bytes());
    input.extend_from_slice(canonical_start);
    hex::encode(crypto.sha256(&input))
}

pub(crate) fn short_code(
    crypto: &dyn CryptoPrimitives,
    secret: &SharedSecret,
    starter: SasParty<'_>,
    accepter: SasParty<'_>,
    transaction_id: &str,
) -> Result<ShortCode, CryptoError> {
    let info = Transcript::new("trustcore.sas.v1")
        .field(starter.address.user_id.as_str())
        .field(starter.address.device_id.as_str())
        .field(starter.key.as_bytes())
        .field(accepter.address.user_id.as_str())
        .field(accepter.address.device_id.as_str())
        .field(accepter.key.as_bytes())
        .field(transaction_id)
        .finish();
    let mut bytes = [0u8; SAS_BYTES];
    crypto.hkdf_sha256(secret.as_bytes(), &[], &info, &mut bytes)?;
    Ok(ShortCode { bytes })
}

/// Key id of a device signing key.
pub(crate) fn signing_key_id(device_id: &DeviceId) -> String {
    format!("ed25519:{device_id}")
}

fn mac(
    crypto: &dyn CryptoPrimitives,
    secret: &SharedSecret,
    sender: &DeviceAddress,
    receiver: &DeviceAddress,
    transaction_id: &str,
    key_id: &str,
    input: &[u8],
) -> Result<String, CryptoError> {
    let info = Transcript::new("trustcore.sas_mac.v1")
        .field(sender.user_id.as_str())
        .field(sender.device_id.as_str())
        .field(receiver.user_id.as_str())
        .field(receiver.device_id.as_str())
        .field(transaction_id)
        .field(key_id)
        .finish();
    let mut key = [0u8; 32];
    crypto.hkdf_sha256(secret.as_bytes(), &[], &info, &mut key)?;
    Ok(hex::encode(crypto.hmac_sha256(&key, input)))
}

/// MACs over our signing key and the list of MACed key ids.
pub(crate) fn key_macs(
    crypto: &dyn CryptoPrimitives,
    secret: &SharedSecret,
    sender: &DeviceAddress,
    receiver: &DeviceAddress,
    transaction_id: &str,
    signing_key: &SigningPublicKey,
) -> Result<(BTreeMap<String, String>, String), CryptoError> {
    let key_id = signing_key_id(&sender.device_id);
    let mut macs = BTreeMap::new();
    macs.insert(
        key_id.clone(),
        mac(crypto, secret, sender, receiver, transaction_id, &key_id, signing_key.as_bytes())?,
    );
    let keys = mac(crypto, secret, sender, receiver, transaction_id, KEY_IDS_MAC_ID, key_id.as_bytes())?;
    Ok((macs, keys))
}

/// Check MACs received from `sender` against the signing key we hold for it.
///
/// Returns false on any mismatch, including a MAC map that names keys other
/// than the sender's device key.
pub(crate) fn verify_key_macs(
    crypto: &dyn CryptoPrimitives,
    secret: &SharedSecret,
    sender: &DeviceAddress,
    receiver: &DeviceAddress,
    transaction_id: &str,
    expected_signing_key: &SigningPublicKey,
    macs: &BTreeMap<String, String>,
    keys: &str,
) -> Result<bool, CryptoError> {
    let (expected, expected_keys) =
        key_macs(crypto, secret, sender, receiver, transaction_id, expected_signing_key)?;
    Ok(macs == &expected && keys == expected_keys)
}
