//! Verification requests: the invitation and ready handshake that precedes a
//! transaction.

use super::{
    cancel::CancelCode,
    methods::{MethodSets, VerificationMethod},
};
use crate::ids::{DeviceId, RoomId, UserId};

/// Snapshot of a verification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerificationRequest {
    /// Local handle, stable from creation
    pub local_id: String,
    /// Transaction id; the event id for in-room requests
    pub transaction_id: String,
    /// User being verified
    pub other_user_id: UserId,
    /// Device being verified, once known
    pub other_device_id: Option<DeviceId>,
    /// Room the request was posted in, for in-room requests
    pub room_id: Option<RoomId>,
    /// True if the peer sent the request
    pub incoming: bool,
    /// Methods advertised in the request
    pub requested_methods: Vec<VerificationMethod>,
    /// Methods advertised in the ready response, once received
    pub ready_methods: Option<Vec<VerificationMethod>>,
    /// Set once a transaction was started
    pub started: bool,
    /// Set when the request or its transaction was cancelled
    pub cancel_code: Option<CancelCode>,
    /// Set when the transaction verified the peer
    pub is_successful: bool,
}

impl PendingVerificationRequest {
    /// Both sides exchanged methods.
    pub fn is_ready(&self) -> bool {
        self.ready_methods.is_some() && !self.is_finished()
    }

    /// Cancelled or completed.
    pub fn is_finished(&self) -> bool {
        self.cancel_code.is_some() || self.is_successful
    }

    /// Method sets of both sides, once ready.
    pub fn method_sets(&self) -> Option<MethodSets> {
        Some(MethodSets {
            requested: self.requested_methods.clone(),
            ready: self.ready_methods.clone()?,
            incoming: self.incoming,
        })
    }

    /// Both sides support SAS.
    pub fn sas_supported(&self) -> bool {
        self.method_sets().is_some_and(|m| m.sas_supported())
    }

    /// The peer can show a QR code we can scan.
    pub fn other_can_show_qr(&self) -> bool {
        self.method_sets().is_some_and(|m| m.other_can_show_qr())
    }

    /// The peer can scan a QR code we show.
    pub fn other_can_scan_qr(&self) -> bool {
        self.method_sets().is_some_and(|m| m.other_can_scan_qr())
    }

    pub(crate) fn cancel(&mut self, code: CancelCode) {
        if !self.is_finished() {
            self.cancel_code = Some(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(incoming: bool) -> PendingVerificationRequest {
        PendingVerificationRequest {
            local_id: "l".into(),
            transaction_id: "t".into(),
            other_user_id: UserId::from("@bob:x"),
            other_device_id: None,
            room_id: None,
            incoming,
            requested_methods: vec![VerificationMethod::SasV1],
            ready_methods: None,
            started: false,
            cancel_code: None,
            is_successful: false,
        }
    }

    #[test]
    fn ready_needs_both_method_lists() {
        let mut req = request(false);
        assert!(!req.is_ready());
        assert!(!req.sas_supported());

        req.ready_methods = Some(vec![VerificationMethod::SasV1]);
        assert!(req.is_ready());
        assert!(req.sas_supported());
    }

    #[test]
    fn cancel_is_sticky() {
        let mut req = request(true);
        req.cancel(CancelCode::Timeout);
        req.cancel(CancelCode::User);
        assert_eq!(req.cancel_code, Some(CancelCode::Timeout));
        assert!(req.is_finished());
    }

    #[test]
    fn success_prevents_later_cancel() {
        let mut req = request(true);
        req.is_successful = true;
        req.cancel(CancelCode::Timeout);
        assert_eq!(req.cancel_code, None);
    }
}
