//! Fuzz target for QrCodeData::decode
//!
//! QR payloads come from a camera and may be anything.
//!
//! # Invariants
//!
//! - NEVER panic, whatever length prefix the payload claims
//! - A payload that decodes encodes back to the same bytes

#![no_main]

use libfuzzer_sys::fuzz_target;
use trustcore_core::verification::QrCodeData;

fuzz_target!(|data: &[u8]| {
    if let Ok(qr) = QrCodeData::decode(data) {
        assert_eq!(qr.encode(), data);
    }
});
