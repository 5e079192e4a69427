//! Verification requests and transactions, serialized per transaction id.
//!
//! The engine owns one flow per transaction id: the request handshake and,
//! once started, the transaction. Protocol state changes under the flow's
//! lock; the lock is released while a message is delivered and retaken to
//! feed the delivery confirmation back into the transaction.
//!
//! Trust only changes here: a transaction that reaches `Verified` marks the
//! peer device verified. A cancelled transaction never touches trust.

use std::{collections::VecDeque, slice, sync::Arc, time::Duration};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use trustcore_crypto::CryptoPrimitives;

use super::{
    cancel::CancelCode,
    error::VerificationError,
    messages::{CancelContent, ReadyContent, RequestContent, StartContent, VerificationMessage},
    methods::VerificationMethod,
    qr::{QR_SECRET_SIZE, QrCodeData, QrMode},
    request::PendingVerificationRequest,
    state::VerificationState,
    transaction::{Outgoing, VerificationProtocol, VerificationTransaction, VerificationTransactionInfo},
};
use crate::{
    codec,
    config::VerificationConfig,
    devices::{DeviceIdentity, DeviceKeyStore},
    direct::DirectSessionCodec,
    env::Environment,
    ids::{DeviceAddress, DeviceId, RoomId, UserId},
    messages::ToDeviceContent,
    scope::{ScopeArena, ScopeHandle},
    store::{CryptoStore, StoreError},
    transport::Transport,
};

/// Bytes of entropy in a generated transaction id
const TRANSACTION_ID_BYTES: usize = 16;

/// Buffered updates per listener before the oldest are dropped
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Change to a request or transaction, for UI listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationUpdate {
    /// Request created or changed
    Request(PendingVerificationRequest),
    /// Transaction created or changed
    Transaction(VerificationTransactionInfo),
}

struct Flow<I> {
    request: PendingVerificationRequest,
    created_at: I,
    finished_at: Option<I>,
    transaction: Option<VerificationTransaction<I>>,
    qr_secret: Option<Vec<u8>>,
}

impl<I> Flow<I> {
    fn new(request: PendingVerificationRequest, created_at: I) -> Self {
        Self { request, created_at, finished_at: None, transaction: None, qr_secret: None }
    }
}

fn invalid_state(transaction_id: &str, action: &'static str) -> VerificationError {
    VerificationError::InvalidState { transaction_id: transaction_id.to_string(), action }
}

/// Interactive device verification.
pub struct VerificationEngine<E: Environment, S: CryptoStore> {
    env: E,
    crypto: Arc<dyn CryptoPrimitives>,
    config: VerificationConfig,
    devices: Arc<DeviceKeyStore<S>>,
    direct: Arc<DirectSessionCodec<E, S>>,
    transport: Arc<dyn Transport>,
    flows: ScopeArena<String, Flow<E::Instant>>,
    updates: broadcast::Sender<VerificationUpdate>,
}

impl<E: Environment, S: CryptoStore> VerificationEngine<E, S> {
    /// Create an engine advertising the configured methods.
    pub fn new(
        env: E,
        crypto: Arc<dyn CryptoPrimitives>,
        config: VerificationConfig,
        devices: Arc<DeviceKeyStore<S>>,
        direct: Arc<DirectSessionCodec<E, S>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            env,
            crypto,
            config,
            devices,
            direct,
            transport,
            flows: ScopeArena::new(),
            updates,
        }
    }

    /// Listen for request and transaction changes.
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationUpdate> {
        self.updates.subscribe()
    }

    /// Snapshot of a request.
    pub async fn request(&self, transaction_id: &str) -> Option<PendingVerificationRequest> {
        let scope = self.flows.get(&transaction_id.to_string())?;
        Some(scope.lock().await.request.clone())
    }

    /// Snapshot of a transaction.
    pub async fn transaction(&self, transaction_id: &str) -> Option<VerificationTransactionInfo> {
        let scope = self.flows.get(&transaction_id.to_string())?;
        scope.lock().await.transaction.as_ref().map(VerificationTransaction::info)
    }

    /// Every request this engine knows. Finished ones are included until
    /// their retention runs out.
    pub async fn requests(&self) -> Vec<PendingVerificationRequest> {
        let mut requests = Vec::new();
        for (_, scope) in self.flows.handles() {
            requests.push(scope.lock().await.request.clone());
        }
        requests.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        requests
    }

    /// Invite a user's device to verify over to-device messages.
    ///
    /// Without a device id, the request goes to every non-blocked current
    /// device of the user and the first to answer becomes the peer.
    ///
    /// # Errors
    ///
    /// - `UnknownDevice` if `device_id` is given and not known
    /// - `NoDevices` if the user has no device to ask
    /// - `Direct` if the request reached no device
    pub async fn request_verification(
        &self,
        user_id: &UserId,
        device_id: Option<&DeviceId>,
    ) -> Result<PendingVerificationRequest, VerificationError> {
        let recipients = match device_id {
            Some(device_id) => vec![self.peer(&DeviceAddress::new(user_id.clone(), device_id.clone()))?],
            None => self.verifiable_devices(user_id)?,
        };
        if recipients.is_empty() {
            return Err(VerificationError::NoDevices(user_id.clone()));
        }

        let transaction_id = self.env.random_id(TRANSACTION_ID_BYTES);
        let request = PendingVerificationRequest {
            local_id: transaction_id.clone(),
            transaction_id: transaction_id.clone(),
            other_user_id: user_id.clone(),
            other_device_id: device_id.cloned(),
            room_id: None,
            incoming: false,
            requested_methods: self.config.methods.clone(),
            ready_methods: None,
            started: false,
            cancel_code: None,
            is_successful: false,
        };
        self.flows.insert(transaction_id.clone(), Flow::new(request.clone(), self.env.now()));
        self.publish(VerificationUpdate::Request(request.clone()));

        let message = VerificationMessage::Request(RequestContent {
            transaction_id: Some(transaction_id.clone()),
            from_device: self.own_device_id(),
            methods: self.config.methods.clone(),
        });
        self.send(&recipients, &message).await?;
        info!(txn = %transaction_id, user = %user_id, devices = recipients.len(), "verification requested");
        Ok(request)
    }

    /// Invite a user to verify by posting a request into a room.
    ///
    /// The event id the room assigns becomes the transaction id. Follow-up
    /// messages travel to-device once a device answers.
    pub async fn request_verification_in_room(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<PendingVerificationRequest, VerificationError> {
        let content = ToDeviceContent::Verification(VerificationMessage::Request(RequestContent {
            transaction_id: None,
            from_device: self.own_device_id(),
            methods: self.config.methods.clone(),
        }));
        let payload = codec::encode(&content.to_raw()?)?;
        let event_id = self.transport.send_to_room(room_id, payload).await?;

        let request = PendingVerificationRequest {
            local_id: self.env.random_id(TRANSACTION_ID_BYTES),
            transaction_id: event_id.clone(),
            other_user_id: user_id.clone(),
            other_device_id: None,
            room_id: Some(room_id.clone()),
            incoming: false,
            requested_methods: self.config.methods.clone(),
            ready_methods: None,
            started: false,
            cancel_code: None,
            is_successful: false,
        };
        self.flows.insert(event_id.clone(), Flow::new(request.clone(), self.env.now()));
        self.publish(VerificationUpdate::Request(request.clone()));
        info!(txn = %event_id, room_id = %room_id, user = %user_id, "in-room verification requested");
        Ok(request)
    }

    /// Record a request seen in a room timeline.
    ///
    /// Returns `None` for our own echo and for duplicates.
    pub fn receive_room_request(
        &self,
        sender: &UserId,
        room_id: &RoomId,
        event_id: &str,
        content: &RequestContent,
    ) -> Result<Option<PendingVerificationRequest>, VerificationError> {
        let address = DeviceAddress::new(sender.clone(), content.from_device.clone());
        if &address == self.devices.own_address() {
            return Ok(None);
        }
        let device = self.peer(&address)?;
        if device.is_blocked() {
            warn!(device = %address, "ignoring verification request from blocked device");
            return Ok(None);
        }
        Ok(self.insert_incoming(&device, event_id.to_string(), Some(room_id.clone()), content.methods.clone()))
    }

    /// Answer an incoming request with the methods we support.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the request is ours, already answered or finished
    /// - `Cancelled(UnknownMethod)` if the two method sets share nothing
    pub async fn accept_request(
        &self,
        transaction_id: &str,
    ) -> Result<PendingVerificationRequest, VerificationError> {
        let scope = self.scope(transaction_id)?;
        let mut flow = scope.lock().await;
        if !flow.request.incoming || flow.request.ready_methods.is_some() || flow.request.is_finished() {
            return Err(invalid_state(transaction_id, "accept"));
        }
        let recipients = self.recipients(&flow)?;
        flow.request.ready_methods = Some(self.config.methods.clone());

        if !flow.request.method_sets().is_some_and(|m| m.any_supported()) {
            let outgoing = self.cancel_flow(&mut flow, CancelCode::UnknownMethod);
            drop(flow);
            self.flush(transaction_id, &recipients, outgoing.into_iter().collect()).await?;
            return Err(VerificationError::Cancelled(CancelCode::UnknownMethod));
        }

        self.publish_flow(&mut flow);
        let request = flow.request.clone();
        drop(flow);

        let ready = Outgoing {
            message: VerificationMessage::Ready(ReadyContent {
                transaction_id: transaction_id.to_string(),
                from_device: self.own_device_id(),
                methods: self.config.methods.clone(),
            }),
            delivered: None,
        };
        self.flush(transaction_id, &recipients, VecDeque::from([ready])).await?;
        info!(txn = %transaction_id, "verification request accepted");
        Ok(request)
    }

    /// Start a SAS exchange on a ready request.
    pub async fn start_sas(
        &self,
        transaction_id: &str,
    ) -> Result<VerificationTransactionInfo, VerificationError> {
        let scope = self.scope(transaction_id)?;
        let mut flow = scope.lock().await;
        if !flow.request.is_ready() || flow.transaction.is_some() {
            return Err(invalid_state(transaction_id, "start SAS on"));
        }
        if !flow.request.sas_supported() {
            return Err(VerificationError::MethodUnsupported(VerificationMethod::SasV1));
        }
        let other = self.other_device(&flow.request)?;
        let (transaction, start) = VerificationTransaction::start_sas(
            &self.env,
            self.crypto.as_ref(),
            transaction_id.to_string(),
            self.devices.own_identity(),
            other.clone(),
        )
        .map_err(VerificationError::Cancelled)?;

        flow.request.started = true;
        flow.transaction = Some(transaction);
        self.publish_flow(&mut flow);
        drop(flow);

        self.flush(transaction_id, slice::from_ref(&other), VecDeque::from([start])).await?;
        self.transaction(transaction_id)
            .await
            .ok_or_else(|| VerificationError::UnknownTransaction(transaction_id.to_string()))
    }

    /// QR code for the peer to scan.
    ///
    /// Repeated calls return the same code.
    pub async fn qr_code(&self, transaction_id: &str) -> Result<QrCodeData, VerificationError> {
        let scope = self.scope(transaction_id)?;
        let mut flow = scope.lock().await;
        if !flow.request.is_ready() || flow.transaction.is_some() {
            return Err(invalid_state(transaction_id, "show a QR code for"));
        }
        if !flow.request.other_can_scan_qr() {
            return Err(VerificationError::MethodUnsupported(VerificationMethod::QrCodeShow));
        }
        let other = self.other_device(&flow.request)?;
        let secret = flow
            .qr_secret
            .get_or_insert_with(|| {
                let mut secret = vec![0u8; QR_SECRET_SIZE];
                self.env.random_bytes(&mut secret);
                secret
            })
            .clone();

        let own = self.devices.own_identity();
        let mode = if own.user_id == other.user_id { QrMode::SelfVerifying } else { QrMode::OtherUser };
        Ok(QrCodeData {
            mode,
            transaction_id: transaction_id.to_string(),
            key1: own.signing_key,
            key2: other.signing_key,
            secret,
        })
    }

    /// Scan the peer's QR code and reciprocate.
    ///
    /// Bytes that do not parse are rejected without cancelling, so the user
    /// can scan again. A code with the wrong transaction or keys cancels.
    pub async fn scan_qr_code(
        &self,
        transaction_id: &str,
        scanned: &[u8],
    ) -> Result<VerificationTransactionInfo, VerificationError> {
        let code = QrCodeData::decode(scanned)?;
        let scope = self.scope(transaction_id)?;
        let mut flow = scope.lock().await;
        if !flow.request.is_ready() || flow.transaction.is_some() {
            return Err(invalid_state(transaction_id, "scan a QR code for"));
        }
        if !flow.request.other_can_show_qr() {
            return Err(VerificationError::MethodUnsupported(VerificationMethod::QrCodeScan));
        }
        let other = self.other_device(&flow.request)?;
        let result = if code.transaction_id == transaction_id {
            VerificationTransaction::reciprocate_qr(&self.env, self.devices.own_identity(), other.clone(), &code)
        } else {
            Err(CancelCode::QrCodeInvalid)
        };
        flow.request.started = true;

        match result {
            Ok((transaction, start)) => {
                flow.transaction = Some(transaction);
                self.publish_flow(&mut flow);
                drop(flow);
                self.flush(transaction_id, slice::from_ref(&other), VecDeque::from([start])).await?;
                self.transaction(transaction_id)
                    .await
                    .ok_or_else(|| VerificationError::UnknownTransaction(transaction_id.to_string()))
            },
            Err(code) => {
                warn!(txn = %transaction_id, %code, "scanned QR code rejected");
                let outgoing = self.cancel_flow(&mut flow, code);
                drop(flow);
                self.flush(transaction_id, slice::from_ref(&other), outgoing.into_iter().collect()).await?;
                Err(VerificationError::Cancelled(code))
            },
        }
    }

    /// User confirmed both devices show the same short code.
    pub async fn confirm_short_code(
        &self,
        transaction_id: &str,
    ) -> Result<VerificationTransactionInfo, VerificationError> {
        self.user_step(
            transaction_id,
            "confirm the short code of",
            VerificationState::ShortCodeReady,
            |tx, crypto| tx.confirm_short_code(crypto),
        )
        .await
    }

    /// User reported the short codes differ.
    pub async fn reject_short_code(&self, transaction_id: &str) -> Result<(), VerificationError> {
        self.user_step(
            transaction_id,
            "reject the short code of",
            VerificationState::ShortCodeReady,
            |tx, _| Ok(tx.cancel(CancelCode::MismatchedSas)),
        )
        .await
        .map(|_| ())
    }

    /// User confirmed the peer scanned our QR code.
    pub async fn confirm_qr_scanned(
        &self,
        transaction_id: &str,
    ) -> Result<VerificationTransactionInfo, VerificationError> {
        self.user_step(
            transaction_id,
            "confirm the scan of",
            VerificationState::QrScannedByOther,
            |tx, _| tx.confirm_qr_scanned(),
        )
        .await
    }

    /// Cancel a request or transaction. Finished ones are left alone.
    pub async fn cancel(&self, transaction_id: &str) -> Result<(), VerificationError> {
        let scope = self.scope(transaction_id)?;
        let mut flow = scope.lock().await;
        if flow.request.is_finished() {
            return Ok(());
        }
        let recipients = self.recipients(&flow)?;
        let outgoing = self.cancel_flow(&mut flow, CancelCode::User);
        drop(flow);
        self.flush(transaction_id, &recipients, outgoing.into_iter().collect()).await
    }

    /// Feed a verification message decrypted from `sender`.
    ///
    /// Peer protocol violations cancel the transaction and are not errors.
    ///
    /// # Errors
    ///
    /// - `Direct` if a reply could not be delivered
    /// - `Device` if a verified device could not be recorded
    pub async fn receive(
        &self,
        sender: &DeviceIdentity,
        message: &VerificationMessage,
    ) -> Result<(), VerificationError> {
        if sender.is_blocked() {
            warn!(device = %sender.address(), kind = message.kind(), "ignoring verification message from blocked device");
            return Ok(());
        }
        if let VerificationMessage::Request(content) = message {
            self.receive_request(sender, content);
            return Ok(());
        }
        let Some(transaction_id) = message.transaction_id().map(str::to_owned) else {
            return Ok(());
        };

        let Some(scope) = self.flows.get(&transaction_id) else {
            if matches!(message, VerificationMessage::Cancel(_) | VerificationMessage::Done(_)) {
                debug!(txn = %transaction_id, kind = message.kind(), "ignoring message for unknown transaction");
                return Ok(());
            }
            warn!(txn = %transaction_id, kind = message.kind(), device = %sender.address(), "message for unknown transaction");
            let cancel = VerificationMessage::Cancel(CancelContent::new(&transaction_id, CancelCode::UnknownTransaction));
            return self.send(slice::from_ref(sender), &cancel).await;
        };

        let mut flow = scope.lock().await;
        if sender.user_id != flow.request.other_user_id {
            drop(flow);
            warn!(txn = %transaction_id, device = %sender.address(), "verification message from unexpected user");
            let cancel = VerificationMessage::Cancel(CancelContent::new(&transaction_id, CancelCode::UserMismatch));
            return self.send(slice::from_ref(sender), &cancel).await;
        }
        if let Some(device_id) = &flow.request.other_device_id
            && device_id != &sender.device_id
        {
            debug!(txn = %transaction_id, device = %sender.address(), "message from another device of the peer, ignoring");
            return Ok(());
        }

        let outgoing = match message {
            VerificationMessage::Ready(content) => self.on_ready(&mut flow, sender, content),
            VerificationMessage::Start(content) => self.on_start(&mut flow, sender, content),
            VerificationMessage::Cancel(content) => {
                let outgoing = self.advance(&mut flow, |tx, crypto| tx.receive(crypto, message))?;
                if !flow.request.is_finished() {
                    info!(txn = %transaction_id, code = %content.code, "verification cancelled by peer");
                    flow.request.cancel(content.code);
                    self.publish_flow(&mut flow);
                }
                outgoing
            },
            VerificationMessage::Done(_) if flow.transaction.is_none() => VecDeque::new(),
            _ if flow.transaction.is_none() => {
                warn!(txn = %transaction_id, kind = message.kind(), "message before start");
                self.cancel_flow(&mut flow, CancelCode::UnexpectedMessage).into_iter().collect()
            },
            _ => self.advance(&mut flow, |tx, crypto| tx.receive(crypto, message))?,
        };
        drop(flow);
        self.flush(&transaction_id, slice::from_ref(sender), outgoing).await
    }

    /// Cancel every request and transaction older than its timeout, and
    /// forget flows that finished more than `finished_retention` ago.
    ///
    /// Returns the ids of the cancelled transactions. Delivery failures of
    /// the cancellation are logged; the local cancel stands regardless.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let now = self.env.now();
        let mut cancelled = Vec::new();
        let mut forgotten = 0usize;
        for (transaction_id, scope) in self.flows.handles() {
            let mut flow = scope.lock().await;
            if let Some(finished_at) = flow.finished_at {
                if now - finished_at >= self.config.finished_retention {
                    drop(flow);
                    self.flows.remove(&transaction_id);
                    forgotten += 1;
                }
                continue;
            }
            let expired = match &flow.transaction {
                Some(tx) => tx.is_expired(now, self.config.transaction_timeout),
                None => !flow.request.is_finished() && now - flow.created_at >= self.config.request_timeout,
            };
            if !expired {
                continue;
            }

            let recipients = self.recipients(&flow).unwrap_or_else(|err| {
                warn!(txn = %transaction_id, error = %err, "no recipients for timeout cancellation");
                Vec::new()
            });
            let outgoing = self.cancel_flow(&mut flow, CancelCode::Timeout);
            drop(flow);
            info!(txn = %transaction_id, "verification timed out");
            if let Err(err) = self.flush(&transaction_id, &recipients, outgoing.into_iter().collect()).await {
                warn!(txn = %transaction_id, error = %err, "timeout cancellation not delivered");
            }
            cancelled.push(transaction_id);
        }
        if forgotten > 0 {
            debug!(forgotten, remaining = self.flows.len(), "finished verifications forgotten");
        }
        cancelled
    }

    /// Call [`Self::check_timeouts`] every `period`. Never returns.
    pub async fn run_timeouts(&self, period: Duration) {
        loop {
            self.env.sleep(period).await;
            self.check_timeouts().await;
        }
    }

    fn receive_request(&self, sender: &DeviceIdentity, content: &RequestContent) {
        let Some(transaction_id) = &content.transaction_id else {
            warn!(device = %sender.address(), "to-device verification request without transaction id");
            return;
        };
        if content.from_device != sender.device_id {
            warn!(device = %sender.address(), claimed = %content.from_device, "request names a different device");
            return;
        }
        self.insert_incoming(sender, transaction_id.clone(), None, content.methods.clone());
    }

    fn insert_incoming(
        &self,
        sender: &DeviceIdentity,
        transaction_id: String,
        room_id: Option<RoomId>,
        methods: Vec<VerificationMethod>,
    ) -> Option<PendingVerificationRequest> {
        let request = PendingVerificationRequest {
            local_id: transaction_id.clone(),
            transaction_id: transaction_id.clone(),
            other_user_id: sender.user_id.clone(),
            other_device_id: Some(sender.device_id.clone()),
            room_id,
            incoming: true,
            requested_methods: methods,
            ready_methods: None,
            started: false,
            cancel_code: None,
            is_successful: false,
        };

        let mut created = false;
        self.flows.get_or_insert_with(&transaction_id, || {
            created = true;
            Flow::new(request.clone(), self.env.now())
        });
        if !created {
            debug!(txn = %transaction_id, "duplicate verification request ignored");
            return None;
        }
        info!(txn = %transaction_id, device = %sender.address(), "verification request received");
        self.publish(VerificationUpdate::Request(request.clone()));
        Some(request)
    }

    fn on_ready(
        &self,
        flow: &mut Flow<E::Instant>,
        sender: &DeviceIdentity,
        content: &ReadyContent,
    ) -> VecDeque<Outgoing> {
        let request = &mut flow.request;
        if request.incoming || request.ready_methods.is_some() || request.is_finished() {
            warn!(txn = %request.transaction_id, device = %sender.address(), "unexpected ready, ignoring");
            return VecDeque::new();
        }
        request.other_device_id = Some(sender.device_id.clone());
        request.ready_methods = Some(content.methods.clone());
        if !request.method_sets().is_some_and(|m| m.any_supported()) {
            return self.cancel_flow(flow, CancelCode::UnknownMethod).into_iter().collect();
        }
        info!(txn = %request.transaction_id, device = %sender.address(), "verification request ready");
        self.publish_flow(flow);
        VecDeque::new()
    }

    fn on_start(
        &self,
        flow: &mut Flow<E::Instant>,
        sender: &DeviceIdentity,
        content: &StartContent,
    ) -> VecDeque<Outgoing> {
        if !flow.request.is_ready() {
            return self.cancel_flow(flow, CancelCode::UnexpectedMessage).into_iter().collect();
        }
        if let Some(existing) = &flow.transaction {
            let simultaneous = existing.we_started()
                && existing.protocol() == VerificationProtocol::Sas
                && matches!(existing.state(), VerificationState::SendingStart | VerificationState::Started)
                && content.method() == Some(VerificationMethod::SasV1);
            if !simultaneous {
                return self.cancel_flow(flow, CancelCode::UnexpectedMessage).into_iter().collect();
            }
            // Both sides started at once: the lower device address wins.
            if &sender.address() > self.devices.own_address() {
                debug!(txn = %flow.request.transaction_id, "simultaneous start, keeping ours");
                return VecDeque::new();
            }
            debug!(txn = %flow.request.transaction_id, "simultaneous start, yielding to peer");
            flow.transaction = None;
        }

        let own = self.devices.own_identity();
        let result = match content.method() {
            Some(VerificationMethod::SasV1) if flow.request.sas_supported() => {
                VerificationTransaction::accept_sas(&self.env, self.crypto.as_ref(), own, sender.clone(), content)
                    .map(|(tx, accept)| (tx, Some(accept)))
            },
            Some(VerificationMethod::Reciprocate) => match &flow.qr_secret {
                Some(secret) => {
                    VerificationTransaction::qr_scanned(&self.env, own, sender.clone(), content, secret)
                        .map(|tx| (tx, None))
                },
                None => Err(CancelCode::UnknownMethod),
            },
            _ => Err(CancelCode::UnknownMethod),
        };
        flow.request.started = true;

        match result {
            Ok((transaction, reply)) => {
                info!(txn = %flow.request.transaction_id, method = %content.method, "verification started by peer");
                flow.transaction = Some(transaction);
                self.publish_flow(flow);
                reply.into_iter().collect()
            },
            Err(code) => {
                warn!(txn = %flow.request.transaction_id, %code, "rejected start");
                self.cancel_flow(flow, code).into_iter().collect()
            },
        }
    }

    async fn user_step<F>(
        &self,
        transaction_id: &str,
        action: &'static str,
        allowed: VerificationState,
        step: F,
    ) -> Result<VerificationTransactionInfo, VerificationError>
    where
        F: FnOnce(&mut VerificationTransaction<E::Instant>, &dyn CryptoPrimitives) -> Result<Option<Outgoing>, CancelCode>
            + Send,
    {
        let scope = self.scope(transaction_id)?;
        let mut flow = scope.lock().await;
        let Some(other) = flow
            .transaction
            .as_ref()
            .filter(|tx| tx.state() == allowed)
            .map(|tx| tx.other().clone())
        else {
            return Err(invalid_state(transaction_id, action));
        };
        let outgoing = self.advance(&mut flow, step)?;
        let info = flow.transaction.as_ref().map(VerificationTransaction::info);
        drop(flow);

        self.flush(transaction_id, slice::from_ref(&other), outgoing).await?;
        info.ok_or_else(|| VerificationError::UnknownTransaction(transaction_id.to_string()))
    }

    /// Run `step` on the flow's transaction and settle the outcome: record
    /// trust on success, mirror a cancel onto the request, publish changes.
    fn advance<F>(&self, flow: &mut Flow<E::Instant>, step: F) -> Result<VecDeque<Outgoing>, VerificationError>
    where
        F: FnOnce(&mut VerificationTransaction<E::Instant>, &dyn CryptoPrimitives) -> Result<Option<Outgoing>, CancelCode>,
    {
        let mut outgoing = VecDeque::new();
        let Some(tx) = flow.transaction.as_mut() else {
            return Ok(outgoing);
        };
        let before = tx.state();
        // A device blocked after the flow started is never marked verified.
        let other = tx.other().address();
        let blocked = !before.is_terminal() && self.devices.device(&other)?.is_some_and(|device| device.is_blocked());
        let result = if blocked {
            warn!(txn = %flow.request.transaction_id, device = %other, "peer device blocked, cancelling verification");
            Ok(tx.cancel(CancelCode::User))
        } else {
            step(tx, self.crypto.as_ref())
        };
        match result {
            Ok(reply) => outgoing.extend(reply),
            Err(code) => {
                warn!(txn = %flow.request.transaction_id, %code, "verification failed");
                outgoing.push_back(Outgoing::cancel(&flow.request.transaction_id, code));
            },
        }

        let after = tx.state();
        match after {
            VerificationState::Verified if before != VerificationState::Verified => {
                let device = tx.other().address();
                self.devices.mark_verified(&device)?;
                flow.request.is_successful = true;
                outgoing.push_back(Outgoing::done(&flow.request.transaction_id));
                info!(txn = %flow.request.transaction_id, device = %device, "verification succeeded");
            },
            VerificationState::Cancelled { code, .. } => flow.request.cancel(code),
            _ => {},
        }
        if after != before {
            self.publish_flow(flow);
        }
        Ok(outgoing)
    }

    /// Cancel the flow from this side. `None` if there is nothing to tell
    /// the peer.
    fn cancel_flow(&self, flow: &mut Flow<E::Instant>, code: CancelCode) -> Option<Outgoing> {
        if flow.request.is_finished() {
            return None;
        }
        flow.request.cancel(code);
        let outgoing = match flow.transaction.as_mut() {
            Some(tx) => tx.cancel(code),
            None => Some(Outgoing::cancel(&flow.request.transaction_id, code)),
        };
        info!(txn = %flow.request.transaction_id, %code, "verification cancelled");
        self.publish_flow(flow);
        outgoing
    }

    /// Deliver queued messages in order, feeding delivery confirmations back
    /// into the transaction until nothing is left to send.
    async fn flush(
        &self,
        transaction_id: &str,
        recipients: &[DeviceIdentity],
        mut outgoing: VecDeque<Outgoing>,
    ) -> Result<(), VerificationError> {
        while let Some(next) = outgoing.pop_front() {
            self.send(recipients, &next.message).await?;
            let Some(event) = next.delivered else { continue };
            let Some(scope) = self.flows.get(&transaction_id.to_string()) else { continue };
            let mut flow = scope.lock().await;
            let more = self.advance(&mut flow, |tx, crypto| tx.acknowledge(crypto, event))?;
            outgoing.extend(more);
        }
        Ok(())
    }

    /// Send to every recipient. Succeeds if at least one delivery did.
    async fn send(
        &self,
        recipients: &[DeviceIdentity],
        message: &VerificationMessage,
    ) -> Result<(), VerificationError> {
        let content = ToDeviceContent::Verification(message.clone());
        let mut delivered = 0usize;
        let mut last_error = None;
        for recipient in recipients {
            match self.direct.send(recipient, &content, self.config.send_attempts).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(device = %recipient.address(), kind = message.kind(), error = %err, "verification message not delivered");
                    last_error = Some(err);
                },
            }
        }
        match last_error {
            Some(err) if delivered == 0 => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn publish(&self, update: VerificationUpdate) {
        // No listeners is not an error.
        let _ = self.updates.send(update);
    }

    /// Publish the flow's request and transaction, and note when it finished.
    fn publish_flow(&self, flow: &mut Flow<E::Instant>) {
        if flow.finished_at.is_none() && flow.request.is_finished() {
            flow.finished_at = Some(self.env.now());
        }
        self.publish(VerificationUpdate::Request(flow.request.clone()));
        if let Some(tx) = &flow.transaction {
            self.publish(VerificationUpdate::Transaction(tx.info()));
        }
    }

    fn scope(&self, transaction_id: &str) -> Result<ScopeHandle<Flow<E::Instant>>, VerificationError> {
        self.flows
            .get(&transaction_id.to_string())
            .ok_or_else(|| VerificationError::UnknownTransaction(transaction_id.to_string()))
    }

    fn own_device_id(&self) -> DeviceId {
        self.devices.own_address().device_id.clone()
    }

    fn peer(&self, address: &DeviceAddress) -> Result<DeviceIdentity, VerificationError> {
        if address == self.devices.own_address() {
            return Err(VerificationError::UnknownDevice(address.clone()));
        }
        self.devices.device(address)?.ok_or_else(|| VerificationError::UnknownDevice(address.clone()))
    }

    fn other_device(&self, request: &PendingVerificationRequest) -> Result<DeviceIdentity, VerificationError> {
        let device_id = request
            .other_device_id
            .as_ref()
            .ok_or_else(|| invalid_state(&request.transaction_id, "address"))?;
        self.peer(&DeviceAddress::new(request.other_user_id.clone(), device_id.clone()))
    }

    fn recipients(&self, flow: &Flow<E::Instant>) -> Result<Vec<DeviceIdentity>, VerificationError> {
        match &flow.request.other_device_id {
            Some(_) => Ok(vec![self.other_device(&flow.request)?]),
            None => Ok(self.verifiable_devices(&flow.request.other_user_id)?),
        }
    }

    fn verifiable_devices(&self, user_id: &UserId) -> Result<Vec<DeviceIdentity>, StoreError> {
        Ok(self
            .devices
            .user_devices(user_id)?
            .into_iter()
            .filter(|device| !device.is_blocked() && !device.stale)
            .collect())
    }
}
