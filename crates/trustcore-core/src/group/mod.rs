//! Group (room) encryption.
//!
//! Every room has at most one outbound session per device. Messages are
//! encrypted with keys from a forward-only hash ratchet and signed with the
//! session's signing key. The session key travels to room members over
//! pairwise channels; members store it as an inbound session that can
//! decrypt any message from its first known index onwards.

mod content;
mod error;
mod inbound;
mod key_request;
mod manager;
mod outbound;

pub use content::{
    ExportedRoomKey, KeyRequestAction, RequestedKeyInfo, RoomCiphertext, RoomKeyContent,
    RoomKeyRequestContent,
};
pub use error::GroupSessionError;
pub use inbound::{InboundGroupSession, InboundSessionKey, MAX_INBOUND_SKIP, SessionOrigin};
pub use key_request::OutgoingKeyRequest;
pub use manager::{GroupSessionManager, ImportResult};
pub use outbound::{OutboundSessionInfo, RotationReason};
