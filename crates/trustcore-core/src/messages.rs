//! Typed content carried inside pairwise-encrypted to-device messages.
//!
//! On the wire every content is a `{type, content}` pair. Decoding dispatches
//! on `type`; types this client does not know decode to
//! [`ToDeviceContent::Unknown`] and are ignored by the caller rather than
//! rejected.

use serde::{Deserialize, Serialize};

use crate::{
    codec::CodecError,
    group::{RoomKeyContent, RoomKeyRequestContent},
    verification::VerificationMessage,
};

/// Wire type of a room key share
pub const ROOM_KEY_TYPE: &str = "m.room_key";

/// Wire type of a room key request or cancellation
pub const ROOM_KEY_REQUEST_TYPE: &str = "m.room_key_request";

/// `{type, content}` pair as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContent {
    /// Content type
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific body
    pub content: ciborium::Value,
}

/// Decrypted to-device content.
#[derive(Debug, Clone, PartialEq)]
pub enum ToDeviceContent {
    /// Group session key share
    RoomKey(RoomKeyContent),
    /// Key request or cancellation
    RoomKeyRequest(RoomKeyRequestContent),
    /// Verification protocol message
    Verification(VerificationMessage),
    /// Type this client does not handle
    Unknown(String),
}

impl ToDeviceContent {
    /// Wire type.
    pub fn kind(&self) -> &str {
        match self {
            Self::RoomKey(_) => ROOM_KEY_TYPE,
            Self::RoomKeyRequest(_) => ROOM_KEY_REQUEST_TYPE,
            Self::Verification(message) => message.kind(),
            Self::Unknown(kind) => kind,
        }
    }

    /// Wire form.
    pub fn to_raw(&self) -> Result<RawContent, CodecError> {
        let content = match self {
            Self::RoomKey(content) => to_value(content)?,
            Self::RoomKeyRequest(content) => to_value(content)?,
            Self::Verification(message) => message.to_value()?,
            Self::Unknown(_) => ciborium::Value::Map(Vec::new()),
        };
        Ok(RawContent { kind: self.kind().to_string(), content })
    }

    /// Parse wire form. Unknown types are not an error.
    ///
    /// # Errors
    ///
    /// - `CodecError::Decode` if a known type has a malformed body
    pub fn from_raw(raw: &RawContent) -> Result<Self, CodecError> {
        match raw.kind.as_str() {
            ROOM_KEY_TYPE => Ok(Self::RoomKey(from_value(&raw.content)?)),
            ROOM_KEY_REQUEST_TYPE => Ok(Self::RoomKeyRequest(from_value(&raw.content)?)),
            kind => Ok(VerificationMessage::from_kind(kind, &raw.content)?
                .map_or_else(|| Self::Unknown(kind.to_string()), Self::Verification)),
        }
    }
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<ciborium::Value, CodecError> {
    ciborium::Value::serialized(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub(crate) fn from_value<T: for<'de> Deserialize<'de>>(value: &ciborium::Value) -> Result<T, CodecError> {
    value.deserialized().map_err(|e| CodecError::Decode(e.to_string()))
}
