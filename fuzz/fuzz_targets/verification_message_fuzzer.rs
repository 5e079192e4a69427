//! Structured fuzz target for verification message bodies
//!
//! Random bytes rarely reach the typed decoders, so this target builds CBOR
//! maps with the field names verification messages use and values of every
//! shape, then parses them under each verification type.
//!
//! # Invariants
//!
//! - NEVER panic, whatever the field types
//! - Parsed messages report the transaction id they were built with

#![no_main]

use arbitrary::Arbitrary;
use ciborium::Value;
use libfuzzer_sys::fuzz_target;
use trustcore_core::verification::{
    ACCEPT_TYPE, CANCEL_TYPE, DONE_TYPE, KEY_TYPE, MAC_TYPE, READY_TYPE, REQUEST_TYPE, START_TYPE,
    VerificationMessage,
};

const KINDS: [&str; 8] =
    [REQUEST_TYPE, READY_TYPE, START_TYPE, ACCEPT_TYPE, KEY_TYPE, MAC_TYPE, DONE_TYPE, CANCEL_TYPE];

const FIELDS: [&str; 12] = [
    "transaction_id",
    "from_device",
    "methods",
    "method",
    "short_authentication_string",
    "secret",
    "commitment",
    "key",
    "mac",
    "keys",
    "code",
    "reason",
];

#[derive(Debug, Arbitrary)]
enum FieldValue {
    Text(String),
    Bytes(Vec<u8>),
    Integer(i64),
    Bool(bool),
    Null,
    TextList(Vec<String>),
    Map(Vec<(String, String)>),
}

impl FieldValue {
    fn into_value(self) -> Value {
        match self {
            Self::Text(text) => Value::Text(text),
            Self::Bytes(bytes) => Value::Bytes(bytes),
            Self::Integer(n) => Value::Integer(n.into()),
            Self::Bool(b) => Value::Bool(b),
            Self::Null => Value::Null,
            Self::TextList(items) => Value::Array(items.into_iter().map(Value::Text).collect()),
            Self::Map(entries) => Value::Map(
                entries.into_iter().map(|(k, v)| (Value::Text(k), Value::Text(v))).collect(),
            ),
        }
    }
}

#[derive(Debug, Arbitrary)]
struct Input {
    kind: u8,
    transaction_id: String,
    fields: Vec<(u8, FieldValue)>,
}

fuzz_target!(|input: Input| {
    let kind = KINDS[usize::from(input.kind) % KINDS.len()];
    let mut entries = vec![(Value::Text("transaction_id".into()), Value::Text(input.transaction_id.clone()))];
    for (field, value) in input.fields.into_iter().take(16) {
        let name = FIELDS[usize::from(field) % FIELDS.len()];
        if name != "transaction_id" {
            entries.push((Value::Text(name.into()), value.into_value()));
        }
    }

    let Ok(Some(message)) = VerificationMessage::from_kind(kind, &Value::Map(entries)) else {
        return;
    };
    assert_eq!(message.kind(), kind);
    if let Some(transaction_id) = message.transaction_id() {
        assert_eq!(transaction_id, input.transaction_id);
    }
});
