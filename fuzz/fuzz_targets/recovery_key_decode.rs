//! Fuzz target for RecoveryKey::decode
//!
//! Recovery keys are typed in by users, so decoding sees arbitrary text:
//! wrong alphabet, wrong length, stray whitespace, broken parity.
//!
//! # Invariants
//!
//! - NEVER panic on any input
//! - Anything that decodes re-encodes to text that decodes to the same key

#![no_main]

use libfuzzer_sys::fuzz_target;
use trustcore_core::RecoveryKey;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let Some(key) = RecoveryKey::decode(&text) else {
        return;
    };

    let again = RecoveryKey::decode(&key.encode()).expect("encoded key must decode");
    assert_eq!(again.as_bytes(), key.as_bytes());
});
