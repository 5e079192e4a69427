//! Recovery key text codec.
//!
//! A recovery key is the backup decryption key written out for a human:
//! `base58(0x8B || 0x01 || key[32] || parity)` with the Bitcoin alphabet,
//! where `parity` is the XOR of every preceding byte. The text is shown in
//! groups of four characters; whitespace is ignored when reading it back.
//! The layout is fixed for interoperability, so base58 is implemented here
//! over exactly these bytes.

use std::fmt;

use trustcore_crypto::KEY_SIZE;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Header bytes preceding the key
pub const RECOVERY_KEY_HEADER: [u8; 2] = [0x8B, 0x01];

/// Header, key and parity byte
const ENCODED_LEN: usize = RECOVERY_KEY_HEADER.len() + KEY_SIZE + 1;

/// Longest base58 text of `ENCODED_LEN` bytes with a non-zero first byte
const MAX_ENCODED_CHARS: usize = 48;

/// Characters per display group
const GROUP_SIZE: usize = 4;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Raw 32-byte backup decryption key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; KEY_SIZE]);

impl RecoveryKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Presentable text, grouped by four characters.
    pub fn encode(&self) -> String {
        let mut bytes = Zeroizing::new([0u8; ENCODED_LEN]);
        bytes[..2].copy_from_slice(&RECOVERY_KEY_HEADER);
        bytes[2..2 + KEY_SIZE].copy_from_slice(&self.0);
        bytes[ENCODED_LEN - 1] = parity(&bytes[..ENCODED_LEN - 1]);

        let plain = Zeroizing::new(base58_encode(&bytes[..]));
        let mut grouped = String::with_capacity(plain.len() + plain.len() / GROUP_SIZE);
        for (i, c) in plain.chars().enumerate() {
            if i > 0 && i % GROUP_SIZE == 0 {
                grouped.push(' ');
            }
            grouped.push(c);
        }
        grouped
    }

    /// Parse presentable text. `None` on a bad character, length, header or
    /// parity byte.
    pub fn decode(text: &str) -> Option<Self> {
        let mut compact = Zeroizing::new(String::with_capacity(MAX_ENCODED_CHARS));
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            if compact.len() >= MAX_ENCODED_CHARS {
                return None;
            }
            compact.push(c);
        }
        let bytes = Zeroizing::new(base58_decode(&compact)?);
        if bytes.len() != ENCODED_LEN || bytes[..2] != RECOVERY_KEY_HEADER {
            return None;
        }
        if parity(&bytes[..ENCODED_LEN - 1]) != bytes[ENCODED_LEN - 1] {
            return None;
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[2..2 + KEY_SIZE]);
        Some(Self(key))
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey(..)")
    }
}

fn parity(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Big-endian base58. Each leading zero byte becomes a leading `1`.
fn base58_encode(input: &[u8]) -> String {
    let zeros = input.iter().take_while(|&&b| b == 0).count();
    // log(256) / log(58) < 1.37
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 137 / 100 + 1);
    for &byte in &input[zeros..] {
        let mut carry = u32::from(byte);
        for digit in &mut digits {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat_n('1', zeros));
    out.extend(digits.iter().rev().map(|&d| char::from(ALPHABET[usize::from(d)])));
    digits.zeroize();
    out
}

fn base58_decode(input: &str) -> Option<Vec<u8>> {
    let zeros = input.bytes().take_while(|&c| c == b'1').count();
    let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
    for c in input.bytes().skip(zeros) {
        let value = ALPHABET.iter().position(|&a| a == c)?;
        let mut carry = value as u32;
        for byte in &mut bytes {
            carry += u32::from(*byte) * 58;
            *byte = (carry & 0xFF) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    bytes.zeroize();
    Some(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn base58_known_vectors() {
        assert_eq!(base58_encode(b""), "");
        assert_eq!(base58_encode(&[0]), "1");
        assert_eq!(base58_encode(&[0, 0, 1]), "112");
        assert_eq!(base58_encode(b"hello world"), "StV1DL6CwTryKyV");
        assert_eq!(base58_decode("StV1DL6CwTryKyV").as_deref(), Some(&b"hello world"[..]));
    }

    #[test]
    fn base58_rejects_ambiguous_characters() {
        for bad in ["0", "O", "I", "l", "+"] {
            assert_eq!(base58_decode(bad), None, "{bad}");
        }
    }

    #[test]
    fn encoded_key_is_grouped_by_four() {
        let text = RecoveryKey::from_bytes([7; KEY_SIZE]).encode();
        let groups: Vec<&str> = text.split(' ').collect();
        assert!(groups.len() > 1);
        assert!(groups[..groups.len() - 1].iter().all(|g| g.len() == GROUP_SIZE));
        assert!(groups.last().is_some_and(|g| (1..=GROUP_SIZE).contains(&g.len())));
    }

    #[test]
    fn encoded_key_starts_with_header_prefix() {
        // 0x8B 0x01 fixes the first characters for every key.
        let a = RecoveryKey::from_bytes([0; KEY_SIZE]).encode();
        let b = RecoveryKey::from_bytes([0xFF; KEY_SIZE]).encode();
        assert_eq!(&a[..2], "Es");
        assert_eq!(&b[..2], "Es");
    }

    #[test]
    fn decode_single_character_fails() {
        assert_eq!(RecoveryKey::decode("1"), None);
    }

    #[test]
    fn decode_strips_trailing_space() {
        let key = RecoveryKey::from_bytes([42; KEY_SIZE]);
        let text = format!("{} ", key.encode());
        assert_eq!(RecoveryKey::decode(&text), Some(key));
    }

    #[test]
    fn decode_accepts_ungrouped_text() {
        let key = RecoveryKey::from_bytes([9; KEY_SIZE]);
        let compact: String = key.encode().split_whitespace().collect();
        assert_eq!(RecoveryKey::decode(&compact), Some(key));
    }

    #[test]
    fn decode_rejects_wrong_header() {
        let mut bytes = [0u8; ENCODED_LEN];
        bytes[0] = 0x8B;
        bytes[1] = 0x02;
        bytes[ENCODED_LEN - 1] = parity(&bytes[..ENCODED_LEN - 1]);
        assert_eq!(RecoveryKey::decode(&base58_encode(&bytes)), None);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let mut bytes = vec![0x8B, 0x01];
        bytes.extend_from_slice(&[1; KEY_SIZE - 1]);
        bytes.push(parity(&bytes));
        assert_eq!(RecoveryKey::decode(&base58_encode(&bytes)), None);
    }

    #[test]
    fn overlong_text_is_refused_before_decoding() {
        for bytes in [[0; KEY_SIZE], [0xFF; KEY_SIZE]] {
            let compact: String = RecoveryKey::from_bytes(bytes).encode().split_whitespace().collect();
            assert!(compact.len() <= MAX_ENCODED_CHARS);
        }

        let key = RecoveryKey::from_bytes([3; KEY_SIZE]);
        assert_eq!(RecoveryKey::decode(&format!("{}2", key.encode())), None);
        assert_eq!(RecoveryKey::decode(&"2".repeat(1 << 20)), None);
        // Whitespace does not count towards the limit.
        assert_eq!(RecoveryKey::decode(&format!("  {}  \n", key.encode().replace(' ', "   "))), Some(key));
    }

    #[test]
    fn debug_hides_key() {
        let key = RecoveryKey::from_bytes([1; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "RecoveryKey(..)");
    }

    proptest! {
        #[test]
        fn roundtrip(raw in any::<[u8; KEY_SIZE]>()) {
            let key = RecoveryKey::from_bytes(raw);
            prop_assert_eq!(RecoveryKey::decode(&key.encode()), Some(key));
        }

        #[test]
        fn single_byte_corruption_is_rejected(
            raw in any::<[u8; KEY_SIZE]>(),
            index in 0..ENCODED_LEN,
            flip in 1u8..=255,
        ) {
            let mut bytes = [0u8; ENCODED_LEN];
            bytes[..2].copy_from_slice(&RECOVERY_KEY_HEADER);
            bytes[2..2 + KEY_SIZE].copy_from_slice(&raw);
            bytes[ENCODED_LEN - 1] = parity(&bytes[..ENCODED_LEN - 1]);
            bytes[index] ^= flip;
            prop_assert_eq!(RecoveryKey::decode(&base58_encode(&bytes)), None);
        }

        #[test]
        fn decode_never_panics(text in "\\PC{0,80}") {
            let _ = RecoveryKey::decode(&text);
        }
    }
}
