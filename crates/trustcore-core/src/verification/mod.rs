//! Interactive device verification.
//!
//! Two devices first agree on methods through a request and ready
//! handshake, then run one transaction: a SAS exchange where both users
//! compare a short code derived from an ephemeral key agreement, or a QR
//! exchange where one device scans a code carrying both signing keys and a
//! shared secret. A transaction that completes marks the peer device
//! verified in the device store.

mod cancel;
mod engine;
mod error;
mod messages;
mod methods;
mod qr;
mod request;
mod sas;
mod state;
mod transaction;

pub use cancel::CancelCode;
pub use engine::{VerificationEngine, VerificationUpdate};
pub use error::VerificationError;
pub use messages::{
    ACCEPT_TYPE, AcceptContent, CANCEL_TYPE, CancelContent, DONE_TYPE, DoneContent, KEY_TYPE,
    KeyContent, MAC_TYPE, MacContent, READY_TYPE, REQUEST_TYPE, ReadyContent, RequestContent,
    START_TYPE, StartContent, VerificationMessage,
};
pub use methods::{MethodSets, VerificationMethod};
pub use qr::{QR_SECRET_SIZE, QrCodeData, QrDecodeError, QrMode};
pub use request::PendingVerificationRequest;
pub use sas::{SAS_EMOJI, SasEmoji, SasMode, ShortCode};
pub use state::{VerificationEvent, VerificationState};
pub use transaction::{VerificationProtocol, VerificationTransactionInfo};
