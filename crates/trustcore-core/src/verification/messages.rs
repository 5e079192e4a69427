//! Verification wire messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trustcore_crypto::AgreementPublicKey;

use super::{
    cancel::CancelCode,
    methods::{VerificationMethod, known_methods},
    sas::{SasMode, known_sas_modes},
};
use crate::{
    codec::CodecError,
    ids::DeviceId,
    messages::{from_value, to_value},
};

/// Wire type of a verification request
pub const REQUEST_TYPE: &str = "m.key.verification.request";
/// Wire type of a ready response
pub const READY_TYPE: &str = "m.key.verification.ready";
/// Wire type of a start message
pub const START_TYPE: &str = "m.key.verification.start";
/// Wire type of a SAS accept
pub const ACCEPT_TYPE: &str = "m.key.verification.accept";
/// Wire type of an ephemeral key
pub const KEY_TYPE: &str = "m.key.verification.key";
/// Wire type of a SAS MAC
pub const MAC_TYPE: &str = "m.key.verification.mac";
/// Wire type of a completion notice
pub const DONE_TYPE: &str = "m.key.verification.done";
/// Wire type of a cancellation
pub const CANCEL_TYPE: &str = "m.key.verification.cancel";

/// Invitation to verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContent {
    /// Transaction id; absent for in-room requests, whose event id takes
    /// its place
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Requesting device
    pub from_device: DeviceId,
    /// Methods the requester supports
    #[serde(deserialize_with = "known_methods")]
    pub methods: Vec<VerificationMethod>,
}

/// Acceptance of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyContent {
    /// Transaction id
    pub transaction_id: String,
    /// Responding device
    pub from_device: DeviceId,
    /// Methods the responder supports
    #[serde(deserialize_with = "known_methods")]
    pub methods: Vec<VerificationMethod>,
}

/// Start of a SAS exchange or a QR reciprocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    /// Transaction id
    pub transaction_id: String,
    /// Starting device
    pub from_device: DeviceId,
    /// Method wire string, kept raw so unknown methods can be cancelled
    /// with the proper code
    pub method: String,
    /// SAS presentation modes the starter can show
    #[serde(default, deserialize_with = "known_sas_modes")]
    pub short_authentication_string: Vec<SasMode>,
    /// QR secret echoed back by the scanner
    #[serde(default, with = "optional_bytes")]
    pub secret: Option<Vec<u8>>,
}

impl StartContent {
    /// Parsed method, `None` if unknown.
    pub fn method(&self) -> Option<VerificationMethod> {
        VerificationMethod::from_wire(&self.method)
    }
}

/// SAS acceptance with the commitment to the accepter's ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    /// Transaction id
    pub transaction_id: String,
    /// Hex SHA-256 over the accepter's key and the canonical start
    pub commitment: String,
    /// Modes both sides can show
    #[serde(deserialize_with = "known_sas_modes")]
    pub short_authentication_string: Vec<SasMode>,
}

/// Ephemeral key for the SAS agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    /// Transaction id
    pub transaction_id: String,
    /// Sender's ephemeral X25519 key
    pub key: AgreementPublicKey,
}

/// MACs over the sender's device keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    /// Transaction id
    pub transaction_id: String,
    /// Key id to hex MAC
    pub mac: BTreeMap<String, String>,
    /// MAC over the sorted key ids
    pub keys: String,
}

/// Sender considers the verification complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneContent {
    /// Transaction id
    pub transaction_id: String,
}

/// Sender ended the verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    /// Transaction id
    pub transaction_id: String,
    /// Machine-readable reason
    pub code: CancelCode,
    /// Human-readable reason
    pub reason: String,
}

impl CancelContent {
    /// Cancellation with the standard reason text for `code`.
    pub fn new(transaction_id: impl Into<String>, code: CancelCode) -> Self {
        Self { transaction_id: transaction_id.into(), code, reason: code.reason().to_string() }
    }
}

/// Any verification message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationMessage {
    /// Request
    Request(RequestContent),
    /// Ready
    Ready(ReadyContent),
    /// Start
    Start(StartContent),
    /// Accept
    Accept(AcceptContent),
    /// Key
    Key(KeyContent),
    /// MAC
    Mac(MacContent),
    /// Done
    Done(DoneContent),
    /// Cancel
    Cancel(CancelContent),
}

impl VerificationMessage {
    /// Wire type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => REQUEST_TYPE,
            Self::Ready(_) => READY_TYPE,
            Self::Start(_) => START_TYPE,
            Self::Accept(_) => ACCEPT_TYPE,
            Self::Key(_) => KEY_TYPE,
            Self::Mac(_) => MAC_TYPE,
            Self::Done(_) => DONE_TYPE,
            Self::Cancel(_) => CANCEL_TYPE,
        }
    }

    /// Transaction this message belongs to. `None` only for in-room
    /// requests.
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::Request(c) => c.transaction_id.as_deref(),
            Self::Ready(c) => Some(&c.transaction_id),
            Self::Start(c) => Some(&c.transaction_id),
            Self::Accept(c) => Some(&c.transaction_id),
            Self::Key(c) => Some(&c.transaction_id),
            Self::Mac(c) => Some(&c.transaction_id),
            Self::Done(c) => Some(&c.transaction_id),
            Self::Cancel(c) => Some(&c.transaction_id),
        }
    }

    /// Body in wire form.
    pub fn to_value(&self) -> Result<ciborium::Value, CodecError> {
        match self {
            Self::Request(c) => to_value(c),
            Self::Ready(c) => to_value(c),
            Self::Start(c) => to_value(c),
            Self::Accept(c) => to_value(c),
            Self::Key(c) => to_value(c),
            Self::Mac(c) => to_value(c),
            Self::Done(c) => to_value(c),
            Self::Cancel(c) => to_value(c),
        }
    }

    /// Parse a body of wire type `kind`. `Ok(None)` if `kind` is not a
    /// verification type.
    pub fn from_kind(kind: &str, value: &ciborium::Value) -> Result<Option<Self>, CodecError> {
        let message = match kind {
            REQUEST_TYPE => Self::Request(from_value(value)?),
            READY_TYPE => Self::Ready(from_value(value)?),
            START_TYPE => Self::Start(from_value(value)?),
            ACCEPT_TYPE => Self::Accept(from_value(value)?),
            KEY_TYPE => Self::Key(from_value(value)?),
            MAC_TYPE => Self::Mac(from_value(value)?),
            DONE_TYPE => Self::Done(from_value(value)?),
            CANCEL_TYPE => Self::Cancel(from_value(value)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

mod optional_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&ciborium::Value::Bytes(bytes.clone())),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value = Option::<ciborium::Value>::deserialize(deserializer)?;
        match value {
            None | Some(ciborium::Value::Null) => Ok(None),
            Some(ciborium::Value::Bytes(bytes)) => Ok(Some(bytes)),
            Some(_) => Err(serde::de::Error::custom("expected a byte string")),
        }
    }
}
