//! One verification transaction, free of I/O.
//!
//! Every method validates its input against the state table and returns the
//! message to send, if any. A protocol violation moves the transaction to
//! `Cancelled { by_me: true }` and returns the cancel code; the caller sends
//! the cancellation.

use std::time::Duration;

use tracing::debug;
use trustcore_crypto::{AgreementPublicKey, AgreementSecret, CryptoPrimitives, SharedSecret};

use super::{
    cancel::CancelCode,
    messages::{
        AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, StartContent,
        VerificationMessage,
    },
    methods::VerificationMethod,
    qr::QrCodeData,
    sas::{self, SasMode, SasParty, ShortCode},
    state::{VerificationEvent, VerificationState},
};
use crate::{codec, devices::DeviceIdentity, env::Environment, ids::DeviceAddress};

/// Method a transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationProtocol {
    /// Short authentication string
    Sas,
    /// QR code reciprocation
    Qr,
}

/// Snapshot of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationTransactionInfo {
    /// Transaction id
    pub transaction_id: String,
    /// Device being verified
    pub other: DeviceAddress,
    /// Method in use
    pub protocol: VerificationProtocol,
    /// Current state
    pub state: VerificationState,
    /// True if this device sent the start
    pub we_started: bool,
    /// Short code, once both ephemeral keys are known
    pub short_code: Option<ShortCode>,
    /// Modes both sides can show
    pub sas_modes: Vec<SasMode>,
}

/// Message queued by a transaction, with the event that confirms its
/// delivery.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub message: VerificationMessage,
    pub delivered: Option<VerificationEvent>,
}

impl Outgoing {
    pub(crate) fn cancel(transaction_id: &str, code: CancelCode) -> Self {
        Self {
            message: VerificationMessage::Cancel(CancelContent::new(transaction_id, code)),
            delivered: None,
        }
    }

    pub(crate) fn done(transaction_id: &str) -> Self {
        Self {
            message: VerificationMessage::Done(DoneContent { transaction_id: transaction_id.to_string() }),
            delivered: None,
        }
    }
}

struct SasExchange {
    our_secret: AgreementSecret,
    our_key: AgreementPublicKey,
    canonical_start: Vec<u8>,
    modes: Vec<SasMode>,
    commitment: Option<String>,
    shared: Option<SharedSecret>,
    short_code: Option<ShortCode>,
    pending_mac: Option<MacContent>,
}

impl SasExchange {
    fn new(
        env: &impl Environment,
        crypto: &dyn CryptoPrimitives,
        canonical_start: Vec<u8>,
        modes: Vec<SasMode>,
    ) -> Self {
        let our_secret = AgreementSecret::from_bytes(env.random_key());
        let our_key = crypto.agreement_public_key(&our_secret);
        Self {
            our_secret,
            our_key,
            canonical_start,
            modes,
            commitment: None,
            shared: None,
            short_code: None,
            pending_mac: None,
        }
    }
}

enum Protocol {
    Sas(Box<SasExchange>),
    Qr,
}

/// One verification transaction between this device and a peer device.
pub(crate) struct VerificationTransaction<I> {
    transaction_id: String,
    own: DeviceIdentity,
    other: DeviceIdentity,
    we_started: bool,
    started_at: I,
    state: VerificationState,
    protocol: Protocol,
}

fn common_modes(ours: &[SasMode], theirs: &[SasMode]) -> Vec<SasMode> {
    ours.iter().copied().filter(|m| theirs.contains(m)).collect()
}

impl<I> VerificationTransaction<I>
where
    I: Copy + std::ops::Sub<Output = Duration>,
{
    fn new(
        transaction_id: String,
        own: DeviceIdentity,
        other: DeviceIdentity,
        we_started: bool,
        started_at: I,
        protocol: Protocol,
    ) -> Self {
        Self {
            transaction_id,
            own,
            other,
            we_started,
            started_at,
            state: VerificationState::None,
            protocol,
        }
    }

    /// Start a SAS exchange as the starter.
    pub(crate) fn start_sas<E: Environment<Instant = I>>(
        env: &E,
        crypto: &dyn CryptoPrimitives,
        transaction_id: String,
        own: DeviceIdentity,
        other: DeviceIdentity,
    ) -> Result<(Self, Outgoing), CancelCode> {
        let start = StartContent {
            transaction_id: transaction_id.clone(),
            from_device: own.device_id.clone(),
            method: VerificationMethod::SasV1.as_str().to_string(),
            short_authentication_string: SasMode::ALL.to_vec(),
            secret: None,
        };
        let canonical_start = codec::encode(&start).map_err(|_| CancelCode::InvalidMessage)?;
        let exchange = SasExchange::new(env, crypto, canonical_start, SasMode::ALL.to_vec());

        let mut tx = Self::new(
            transaction_id,
            own,
            other,
            true,
            env.now(),
            Protocol::Sas(Box::new(exchange)),
        );
        tx.apply(VerificationEvent::QueueStart)?;
        let outgoing = Outgoing {
            message: VerificationMessage::Start(start),
            delivered: Some(VerificationEvent::StartDelivered),
        };
        Ok((tx, outgoing))
    }

    /// Answer a peer's SAS start with a commitment to our ephemeral key.
    ///
    /// The commitment covers the start as this device re-encodes it, which
    /// both sides compute identically from the same parsed fields.
    pub(crate) fn accept_sas<E: Environment<Instant = I>>(
        env: &E,
        crypto: &dyn CryptoPrimitives,
        own: DeviceIdentity,
        other: DeviceIdentity,
        start: &StartContent,
    ) -> Result<(Self, Outgoing), CancelCode> {
        let modes = common_modes(&SasMode::ALL, &start.short_authentication_string);
        if modes.is_empty() {
            return Err(CancelCode::UnknownMethod);
        }
        let canonical_start = codec::encode(start).map_err(|_| CancelCode::InvalidMessage)?;
        let exchange = SasExchange::new(env, crypto, canonical_start, modes.clone());
        let commitment = sas::commitment(crypto, &exchange.our_key, &exchange.canonical_start);

        let mut tx = Self::new(
            start.transaction_id.clone(),
            own,
            other,
            false,
            env.now(),
            Protocol::Sas(Box::new(exchange)),
        );
        tx.apply(VerificationEvent::ReceiveStart)?;
        tx.apply(VerificationEvent::QueueAccept)?;
        let outgoing = Outgoing {
            message: VerificationMessage::Accept(AcceptContent {
                transaction_id: tx.transaction_id.clone(),
                commitment,
                short_authentication_string: modes,
            }),
            delivered: Some(VerificationEvent::AcceptDelivered),
        };
        Ok((tx, outgoing))
    }

    /// Reciprocate a scanned QR code.
    ///
    /// The code must carry the peer's signing key as we know it and our own
    /// signing key as the peer knows it.
    pub(crate) fn reciprocate_qr<E: Environment<Instant = I>>(
        env: &E,
        own: DeviceIdentity,
        other: DeviceIdentity,
        code: &QrCodeData,
    ) -> Result<(Self, Outgoing), CancelCode> {
        if code.key1 != other.signing_key || code.key2 != own.signing_key {
            return Err(CancelCode::KeyMismatch);
        }
        let start = StartContent {
            transaction_id: code.transaction_id.clone(),
            from_device: own.device_id.clone(),
            method: VerificationMethod::Reciprocate.as_str().to_string(),
            short_authentication_string: Vec::new(),
            secret: Some(code.secret.clone()),
        };
        let mut tx =
            Self::new(code.transaction_id.clone(), own, other, true, env.now(), Protocol::Qr);
        tx.apply(VerificationEvent::QrReciprocated)?;
        Ok((tx, Outgoing { message: VerificationMessage::Start(start), delivered: None }))
    }

    /// Peer scanned the code we displayed and echoed its secret.
    pub(crate) fn qr_scanned<E: Environment<Instant = I>>(
        env: &E,
        own: DeviceIdentity,
        other: DeviceIdentity,
        start: &StartContent,
        expected_secret: &[u8],
    ) -> Result<Self, CancelCode> {
        if start.secret.as_deref() != Some(expected_secret) {
            return Err(CancelCode::QrCodeInvalid);
        }
        let mut tx =
            Self::new(start.transaction_id.clone(), own, other, false, env.now(), Protocol::Qr);
        tx.apply(VerificationEvent::QrScannedByOther)?;
        Ok(tx)
    }

    pub(crate) fn state(&self) -> VerificationState {
        self.state
    }

    pub(crate) fn other(&self) -> &DeviceIdentity {
        &self.other
    }

    pub(crate) fn we_started(&self) -> bool {
        self.we_started
    }

    pub(crate) fn protocol(&self) -> VerificationProtocol {
        match self.protocol {
            Protocol::Sas(_) => VerificationProtocol::Sas,
            Protocol::Qr => VerificationProtocol::Qr,
        }
    }

    pub(crate) fn is_expired(&self, now: I, timeout: Duration) -> bool {
        !self.state.is_terminal() && now - self.started_at >= timeout
    }

    pub(crate) fn info(&self) -> VerificationTransactionInfo {
        let (short_code, sas_modes) = match &self.protocol {
            Protocol::Sas(sas) => (sas.short_code, sas.modes.clone()),
            Protocol::Qr => (None, Vec::new()),
        };
        VerificationTransactionInfo {
            transaction_id: self.transaction_id.clone(),
            other: self.other.address(),
            protocol: self.protocol(),
            state: self.state,
            we_started: self.we_started,
            short_code,
            sas_modes,
        }
    }

    /// Cancel from this side. `None` if already terminal.
    pub(crate) fn cancel(&mut self, code: CancelCode) -> Option<Outgoing> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = VerificationState::Cancelled { code, by_me: true };
        debug!(txn = %self.transaction_id, %code, "verification cancelled by us");
        Some(Outgoing::cancel(&self.transaction_id, code))
    }

    /// Feed a message from the peer.
    pub(crate) fn receive(
        &mut self,
        crypto: &dyn CryptoPrimitives,
        message: &VerificationMessage,
    ) -> Result<Option<Outgoing>, CancelCode> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        let result = match message {
            VerificationMessage::Accept(accept) => self.receive_accept(accept).map(Some),
            VerificationMessage::Key(key) => self.receive_key(crypto, key),
            VerificationMessage::Mac(mac) => self.receive_mac(crypto, mac).map(|()| None),
            VerificationMessage::Done(_)
                if self.state == VerificationState::WaitingOtherReciprocateConfirm =>
            {
                self.apply(VerificationEvent::ReceiveDone).map(|()| None)
            },
            VerificationMessage::Done(_) => Ok(None),
            VerificationMessage::Cancel(cancel) => {
                self.state = VerificationState::Cancelled { code: cancel.code, by_me: false };
                debug!(txn = %self.transaction_id, code = %cancel.code, "verification cancelled by peer");
                Ok(None)
            },
            VerificationMessage::Request(_)
            | VerificationMessage::Ready(_)
            | VerificationMessage::Start(_) => Err(CancelCode::UnexpectedMessage),
        };
        result.map_err(|code| self.fail(code))
    }

    /// Delivery of one of our messages was confirmed.
    pub(crate) fn acknowledge(
        &mut self,
        crypto: &dyn CryptoPrimitives,
        event: VerificationEvent,
    ) -> Result<Option<Outgoing>, CancelCode> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        self.apply(event)?;
        let result = match (event, self.state) {
            (VerificationEvent::KeyDelivered, VerificationState::KeySent) if !self.we_started => {
                self.apply(VerificationEvent::DeriveShortCode)
            },
            (VerificationEvent::MacDelivered, VerificationState::MacSent) => {
                match self.sas_mut().map(|sas| sas.pending_mac.take()) {
                    Ok(Some(mac)) => self.verify_mac(crypto, &mac),
                    Ok(None) => Ok(()),
                    Err(code) => Err(code),
                }
            },
            _ => Ok(()),
        };
        result.map(|()| None).map_err(|code| self.fail(code))
    }

    /// User confirmed the short codes match.
    pub(crate) fn confirm_short_code(
        &mut self,
        crypto: &dyn CryptoPrimitives,
    ) -> Result<Option<Outgoing>, CancelCode> {
        let result = self.queue_mac(crypto);
        result.map(Some).map_err(|code| self.fail(code))
    }

    /// User confirmed the peer scanned our code.
    pub(crate) fn confirm_qr_scanned(&mut self) -> Result<Option<Outgoing>, CancelCode> {
        self.apply(VerificationEvent::QrConfirmed).map(|()| None)
    }

    fn queue_mac(&mut self, crypto: &dyn CryptoPrimitives) -> Result<Outgoing, CancelCode> {
        self.apply(VerificationEvent::ConfirmShortCode)?;
        let own = self.own.address();
        let other = self.other.address();
        let signing_key = self.own.signing_key;
        let txn = self.transaction_id.clone();

        let sas = self.sas_mut()?;
        let shared = sas.shared.as_ref().ok_or(CancelCode::UnexpectedMessage)?;
        let (mac, keys) = sas::key_macs(crypto, shared, &own, &other, &txn, &signing_key)
            .map_err(|_| CancelCode::InvalidMessage)?;

        self.apply(VerificationEvent::QueueMac)?;
        Ok(Outgoing {
            message: VerificationMessage::Mac(MacContent { transaction_id: txn, mac, keys }),
            delivered: Some(VerificationEvent::MacDelivered),
        })
    }

    fn receive_accept(&mut self, accept: &AcceptContent) -> Result<Outgoing, CancelCode> {
        if !self.we_started {
            return Err(CancelCode::UnexpectedMessage);
        }
        self.apply(VerificationEvent::ReceiveAccept)?;

        let sas = self.sas_mut()?;
        let modes = common_modes(&sas.modes, &accept.short_authentication_string);
        if modes.is_empty() {
            return Err(CancelCode::UnknownMethod);
        }
        sas.modes = modes;
        sas.commitment = Some(accept.commitment.clone());
        let our_key = sas.our_key;

        self.apply(VerificationEvent::QueueKey)?;
        Ok(Outgoing {
            message: VerificationMessage::Key(KeyContent {
                transaction_id: self.transaction_id.clone(),
                key: our_key,
            }),
            delivered: Some(VerificationEvent::KeyDelivered),
        })
    }

    fn receive_key(
        &mut self,
        crypto: &dyn CryptoPrimitives,
        key: &KeyContent,
    ) -> Result<Option<Outgoing>, CancelCode> {
        self.apply(VerificationEvent::ReceiveKey)?;
        let we_started = self.we_started;
        let own = self.own.address();
        let other = self.other.address();
        let txn = self.transaction_id.clone();

        let sas = self.sas_mut()?;
        if we_started {
            let expected = sas::commitment(crypto, &key.key, &sas.canonical_start);
            if sas.commitment.as_deref() != Some(expected.as_str()) {
                return Err(CancelCode::MismatchedCommitment);
            }
        }
        let shared = crypto
            .key_agreement(&sas.our_secret, &key.key)
            .map_err(|_| CancelCode::InvalidMessage)?;

        let ours = SasParty { address: &own, key: &sas.our_key };
        let theirs = SasParty { address: &other, key: &key.key };
        let (starter, accepter) = if we_started { (ours, theirs) } else { (theirs, ours) };
        let code = sas::short_code(crypto, &shared, starter, accepter, &txn)
            .map_err(|_| CancelCode::InvalidMessage)?;
        sas.shared = Some(shared);
        sas.short_code = Some(code);
        let our_key = sas.our_key;

        if we_started {
            self.apply(VerificationEvent::DeriveShortCode)?;
            return Ok(None);
        }
        self.apply(VerificationEvent::QueueKey)?;
        Ok(Some(Outgoing {
            message: VerificationMessage::Key(KeyContent { transaction_id: txn, key: our_key }),
            delivered: Some(VerificationEvent::KeyDelivered),
        }))
    }

    fn receive_mac(&mut self, crypto: &dyn CryptoPrimitives, mac: &MacContent) -> Result<(), CancelCode> {
        if self.state.holds_early_mac() {
            self.apply(VerificationEvent::ReceiveMac)?;
            self.sas_mut()?.pending_mac = Some(mac.clone());
            debug!(txn = %self.transaction_id, "holding peer MAC until ours is delivered");
            return Ok(());
        }
        self.verify_mac(crypto, mac)
    }

    fn verify_mac(&mut self, crypto: &dyn CryptoPrimitives, mac: &MacContent) -> Result<(), CancelCode> {
        self.apply(VerificationEvent::ReceiveMac)?;
        let own = self.own.address();
        let other = self.other.address();
        let expected_key = self.other.signing_key;
        let txn = self.transaction_id.clone();

        let sas = self.sas_mut()?;
        let shared = sas.shared.as_ref().ok_or(CancelCode::UnexpectedMessage)?;
        let matches = sas::verify_key_macs(
            crypto,
            shared,
            &other,
            &own,
            &txn,
            &expected_key,
            &mac.mac,
            &mac.keys,
        )
        .map_err(|_| CancelCode::InvalidMessage)?;
        if !matches {
            return Err(CancelCode::KeyMismatch);
        }
        self.apply(VerificationEvent::MacsVerified)
    }

    fn sas_mut(&mut self) -> Result<&mut SasExchange, CancelCode> {
        match &mut self.protocol {
            Protocol::Sas(sas) => Ok(&mut **sas),
            Protocol::Qr => Err(CancelCode::UnexpectedMessage),
        }
    }

    /// Apply `event`, treating an invalid edge as an unexpected message.
    fn apply(&mut self, event: VerificationEvent) -> Result<(), CancelCode> {
        let next = self.state.next(event).ok_or(CancelCode::UnexpectedMessage)?;
        if next != self.state {
            debug!(txn = %self.transaction_id, from = ?self.state, to = ?next, ?event, "verification state");
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, code: CancelCode) -> CancelCode {
        if !self.state.is_terminal() {
            self.state = VerificationState::Cancelled { code, by_me: true };
        }
        code
    }
}
