//! Verification transaction state machine.
//!
//! Pure transition table over [`VerificationState`] and [`VerificationEvent`].
//! `Sending*` states wait for the transport to confirm delivery of our own
//! message; the peer may answer before that confirmation is processed, so the
//! table accepts the answer there too.
//!
//! ```text
//! starter:   None -> SendingStart -> Started -> OnAccepted -> SendingKey -> KeySent
//!                 -> OnKeyReceived -> ShortCodeReady
//! accepter:  None -> OnStarted -> SendingAccept -> Accepted -> OnKeyReceived
//!                 -> SendingKey -> KeySent -> ShortCodeReady
//! both:      ShortCodeReady -> ShortCodeAccepted -> SendingMac -> MacSent
//!                 -> Verifying -> Verified
//! QR shower: None -> QrScannedByOther -> Verified
//! QR scanner: None -> WaitingOtherReciprocateConfirm -> Verified
//! ```
//!
//! `Verified` and `Cancelled` are terminal and absorb every event.

use super::cancel::CancelCode;

/// State of one verification transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationState {
    /// Nothing sent or received yet
    None,
    /// Our start is being delivered
    SendingStart,
    /// Our start was delivered
    Started,
    /// Peer's start received
    OnStarted,
    /// Our accept is being delivered
    SendingAccept,
    /// Our accept was delivered
    Accepted,
    /// Peer's accept received
    OnAccepted,
    /// Our ephemeral key is being delivered
    SendingKey,
    /// Our ephemeral key was delivered
    KeySent,
    /// Peer's ephemeral key received
    OnKeyReceived,
    /// Short code can be shown to the user
    ShortCodeReady,
    /// User confirmed the short codes match
    ShortCodeAccepted,
    /// Our MAC is being delivered
    SendingMac,
    /// Our MAC was delivered
    MacSent,
    /// Checking the peer's MAC
    Verifying,
    /// Peer scanned our QR code and echoed the secret
    QrScannedByOther,
    /// We scanned the peer's QR code and wait for its confirmation
    WaitingOtherReciprocateConfirm,
    /// Peer device verified
    Verified,
    /// Ended without success
    Cancelled {
        /// Reason
        code: CancelCode,
        /// True if this device cancelled
        by_me: bool,
    },
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationEvent {
    /// We queued a start
    QueueStart,
    /// Our start was delivered
    StartDelivered,
    /// Peer's start arrived
    ReceiveStart,
    /// We queued an accept
    QueueAccept,
    /// Our accept was delivered
    AcceptDelivered,
    /// Peer's accept arrived
    ReceiveAccept,
    /// We queued our ephemeral key
    QueueKey,
    /// Our ephemeral key was delivered
    KeyDelivered,
    /// Peer's ephemeral key arrived
    ReceiveKey,
    /// Both keys known, short code derived
    DeriveShortCode,
    /// User confirmed the short codes match
    ConfirmShortCode,
    /// We queued our MAC
    QueueMac,
    /// Our MAC was delivered
    MacDelivered,
    /// Peer's MAC arrived
    ReceiveMac,
    /// Peer's MAC matched its device key
    MacsVerified,
    /// Peer echoed the secret of our QR code
    QrScannedByOther,
    /// We scanned the peer's code and sent the reciprocation
    QrReciprocated,
    /// User confirmed the peer scanned our code
    QrConfirmed,
    /// Peer reported completion
    ReceiveDone,
    /// Transaction cancelled
    Cancel {
        /// Reason
        code: CancelCode,
        /// True if this device cancelled
        by_me: bool,
    },
}

impl VerificationState {
    /// True for `Verified` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled { .. })
    }

    /// True while a peer MAC that arrives now must be held until our own MAC
    /// is delivered.
    pub(crate) fn holds_early_mac(&self) -> bool {
        matches!(
            self,
            Self::SendingKey
                | Self::KeySent
                | Self::ShortCodeReady
                | Self::ShortCodeAccepted
                | Self::SendingMac
        )
    }

    /// Next state, or `None` if `event` is not valid here.
    ///
    /// Terminal states return themselves for every event. Late delivery
    /// confirmations leave the state unchanged.
    pub fn next(&self, event: VerificationEvent) -> Option<Self> {
        use VerificationEvent as E;

        if self.is_terminal() {
            return Some(*self);
        }

        let next = match (*self, event) {
            (_, E::Cancel { code, by_me }) => Self::Cancelled { code, by_me },

            (Self::None, E::QueueStart) => Self::SendingStart,
            (Self::SendingStart, E::StartDelivered) => Self::Started,
            (Self::SendingStart | Self::Started, E::ReceiveAccept) => Self::OnAccepted,
            (Self::OnAccepted, E::QueueKey) => Self::SendingKey,

            (Self::None, E::ReceiveStart) => Self::OnStarted,
            (Self::OnStarted, E::QueueAccept) => Self::SendingAccept,
            (Self::SendingAccept, E::AcceptDelivered) => Self::Accepted,
            (Self::SendingAccept | Self::Accepted, E::ReceiveKey) => Self::OnKeyReceived,
            (Self::OnKeyReceived, E::QueueKey) => Self::SendingKey,

            (Self::SendingKey, E::KeyDelivered) => Self::KeySent,
            (Self::SendingKey | Self::KeySent, E::ReceiveKey) => Self::OnKeyReceived,
            (Self::OnKeyReceived | Self::KeySent, E::DeriveShortCode) => Self::ShortCodeReady,

            (Self::ShortCodeReady, E::ConfirmShortCode) => Self::ShortCodeAccepted,
            (Self::ShortCodeAccepted, E::QueueMac) => Self::SendingMac,
            (Self::SendingMac, E::MacDelivered) => Self::MacSent,
            (state, E::ReceiveMac) if state.holds_early_mac() => state,
            (Self::MacSent, E::ReceiveMac) => Self::Verifying,
            (Self::Verifying, E::MacsVerified) => Self::Verified,

            (Self::None, E::QrScannedByOther) => Self::QrScannedByOther,
            (Self::QrScannedByOther, E::QrConfirmed) => Self::Verified,
            (Self::None, E::QrReciprocated) => Self::WaitingOtherReciprocateConfirm,
            (Self::WaitingOtherReciprocateConfirm, E::ReceiveDone) => Self::Verified,

            (
                state,
                E::StartDelivered | E::AcceptDelivered | E::KeyDelivered | E::MacDelivered,
            ) => state,

            _ => return None,
        };
        Some(next)
    }
}
