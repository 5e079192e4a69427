//! Fuzz target for decrypted to-device content
//!
//! A peer controls the plaintext it encrypts to us, so the `{type, content}`
//! envelope and every typed body must survive malformed CBOR.
//!
//! # Invariants
//!
//! - NEVER panic on malformed CBOR
//! - Known types that parse re-encode to an equal value

#![no_main]

use libfuzzer_sys::fuzz_target;
use trustcore_core::{
    codec,
    messages::{RawContent, ToDeviceContent},
};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = codec::decode::<RawContent>(data) else {
        return;
    };
    let Ok(content) = ToDeviceContent::from_raw(&raw) else {
        return;
    };
    if matches!(content, ToDeviceContent::Unknown(_)) {
        return;
    }

    let encoded = content.to_raw().expect("parsed content must encode");
    let reparsed = ToDeviceContent::from_raw(&encoded).expect("encoded content must parse");
    assert_eq!(reparsed, content);
});
