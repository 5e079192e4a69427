//! Per-room group session lifecycle: rotation, key sharing, inbound session
//! installation and key requests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::{debug, error, info, warn};
use trustcore_crypto::{AgreementPublicKey, CryptoPrimitives};

use super::{
    content::{ExportedRoomKey, RoomCiphertext, RoomKeyContent},
    error::GroupSessionError,
    inbound::{InboundGroupSession, InboundSessionKey, SessionOrigin},
    key_request::{KeyRequestTracker, OutgoingKeyRequest},
    outbound::{OutboundGroupSession, OutboundSessionInfo, RotationReason},
};
use crate::{
    config::GroupSessionConfig,
    devices::{DeviceIdentity, DeviceKeyStore},
    direct::DirectSessionCodec,
    env::Environment,
    ids::{DeviceAddress, RoomId},
    messages::ToDeviceContent,
    ratchet::NONCE_RANDOM_SIZE,
    scope::ScopeArena,
    store::CryptoStore,
};

/// Outcome of a bulk import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportResult {
    /// Sessions offered
    pub total_count: usize,
    /// Sessions that were new or better than the stored copy
    pub imported_count: usize,
}

struct RoomScope<I> {
    outbound: Option<OutboundGroupSession<I>>,
}

impl<I> Default for RoomScope<I> {
    fn default() -> Self {
        Self { outbound: None }
    }
}

/// Group sessions for every room this device participates in.
///
/// Operations on one room are serialized; rooms proceed in parallel. The
/// room lock is released while a session key is being delivered, so a slow
/// device never blocks other rooms and concurrent sends in the same room
/// only wait for the bookkeeping, not the network.
pub struct GroupSessionManager<E: Environment, S: CryptoStore> {
    env: E,
    crypto: Arc<dyn CryptoPrimitives>,
    config: GroupSessionConfig,
    store: S,
    devices: Arc<DeviceKeyStore<S>>,
    direct: Arc<DirectSessionCodec<E, S>>,
    rooms: ScopeArena<RoomId, RoomScope<E::Instant>>,
    key_requests: KeyRequestTracker,
}

impl<E: Environment, S: CryptoStore> GroupSessionManager<E, S> {
    /// Create a manager with no outbound sessions.
    pub fn new(
        env: E,
        crypto: Arc<dyn CryptoPrimitives>,
        config: GroupSessionConfig,
        store: S,
        devices: Arc<DeviceKeyStore<S>>,
        direct: Arc<DirectSessionCodec<E, S>>,
    ) -> Self {
        Self {
            env,
            crypto,
            config,
            store,
            devices,
            direct,
            rooms: ScopeArena::new(),
            key_requests: KeyRequestTracker::default(),
        }
    }

    /// Encrypt a room message for the room's current devices.
    ///
    /// Rotates the room's outbound session first if it is too old, has
    /// reached its message limit, or its audience no longer matches the
    /// eligible devices. The session key is then delivered to every eligible
    /// device that lacks it. A device whose delivery fails is withheld and
    /// retried on the next call; it never fails the message.
    ///
    /// # Errors
    ///
    /// - `Crypto`, `Ratchet` if encryption itself fails
    /// - `Store` if the own inbound copy of a new session cannot be saved
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        plaintext: &[u8],
        room_devices: &[DeviceAddress],
    ) -> Result<RoomCiphertext, GroupSessionError> {
        let eligible = self.eligible_devices(room_devices)?;
        let audience: BTreeSet<DeviceAddress> = eligible.keys().cloned().collect();
        let scope = self.rooms.get_or_insert_with(room_id, RoomScope::default);

        loop {
            let (session_id, created, room_key, targets) = {
                let mut room = scope.lock().await;
                let (session, created) = self.current_outbound(&mut room, room_id, &audience)?;
                let targets = session.pending_targets(&audience);
                session.begin_share(&targets);
                (session.session_id().to_owned(), created, session.room_key(), targets)
            };

            let (delivered, failed) = self.share(&room_key, &targets, &eligible).await;

            let mut room = scope.lock().await;
            let Some(session) =
                room.outbound.as_mut().filter(|session| session.session_id() == session_id)
            else {
                debug!(room_id = %room_id, "outbound session replaced during share, retrying");
                continue;
            };
            session.finish_share(&delivered, &failed);

            // Concurrent sends may have pushed the session over a limit while
            // we were sharing. A session created by this call is used at
            // least once so a degenerate config cannot livelock.
            if !created
                && let Some(reason) = session.rotation_reason(self.env.now(), &audience, &self.config)
            {
                debug!(room_id = %room_id, %reason, "outbound session hit a limit during share");
                continue;
            }

            let own = self.devices.own_identity();
            let mut suffix = [0u8; NONCE_RANDOM_SIZE];
            self.env.random_bytes(&mut suffix);
            return session.encrypt(
                self.crypto.as_ref(),
                suffix,
                own.identity_key,
                &own.device_id,
                plaintext,
            );
        }
    }

    /// Decrypt a room message with a stored inbound session.
    ///
    /// # Errors
    ///
    /// - `MissingSession` if the session is unknown; see
    ///   [`Self::request_room_key`]
    /// - `UnknownMessageIndex` if our copy starts after the message
    /// - `Crypto` if the signature or AEAD check fails
    pub fn decrypt(
        &self,
        room_id: &RoomId,
        message: &RoomCiphertext,
    ) -> Result<Vec<u8>, GroupSessionError> {
        if &message.room_id != room_id {
            return Err(GroupSessionError::InvalidSessionData(format!(
                "message for {} delivered to {room_id}",
                message.room_id
            )));
        }
        let key = InboundSessionKey {
            room_id: room_id.clone(),
            sender_key: message.sender_key,
            session_id: message.session_id.clone(),
        };
        let session = self.store.load_inbound_session(&key)?.ok_or_else(|| {
            GroupSessionError::MissingSession {
                room_id: room_id.clone(),
                session_id: message.session_id.clone(),
            }
        })?;
        session.decrypt(self.crypto.as_ref(), message)
    }

    /// Install a room key that arrived over a pairwise channel.
    ///
    /// Returns true if the session was new or better than our copy.
    ///
    /// # Errors
    ///
    /// - `BlockedSender` if the sending device is blocked
    /// - `InvalidSessionData` if the session id does not match its key
    pub async fn receive_room_key(
        &self,
        sender: &DeviceIdentity,
        content: &RoomKeyContent,
    ) -> Result<bool, GroupSessionError> {
        if sender.is_blocked() {
            warn!(device = %sender.address(), room_id = %content.room_id, "ignoring room key from blocked device");
            return Err(GroupSessionError::BlockedSender(sender.address()));
        }
        let session = InboundGroupSession::from_room_key(sender, content)?;
        let installed = self.install(session).await?;
        debug!(
            device = %sender.address(),
            room_id = %content.room_id,
            session_id = %content.session_id,
            installed,
            "received room key"
        );
        Ok(installed)
    }

    /// Import exported sessions.
    ///
    /// Idempotent: a session already stored at the same or a lower first
    /// known index is skipped, one at a strictly lower index replaces the
    /// stored copy. Invalid entries are logged and skipped. `progress` is
    /// called with `(processed, total)` after every entry, and every entry
    /// before a storage failure stays committed.
    pub async fn import_inbound_sessions(
        &self,
        exports: &[ExportedRoomKey],
        origin: SessionOrigin,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<ImportResult, GroupSessionError> {
        let total_count = exports.len();
        let mut imported_count = 0;
        for (processed, export) in exports.iter().enumerate() {
            match InboundGroupSession::from_export(export, origin) {
                Ok(session) => {
                    if self.install(session).await? {
                        imported_count += 1;
                    }
                },
                Err(err) => {
                    warn!(room_id = %export.room_id, session_id = %export.session_id, error = %err, "skipping invalid exported session");
                },
            }
            progress(processed + 1, total_count);
        }
        info!(total_count, imported_count, ?origin, "imported inbound group sessions");
        Ok(ImportResult { total_count, imported_count })
    }

    /// Every stored inbound session in portable form.
    pub fn export_inbound_sessions(&self) -> Result<Vec<ExportedRoomKey>, GroupSessionError> {
        Ok(self.store.load_inbound_sessions()?.iter().map(InboundGroupSession::export).collect())
    }

    /// Stored inbound session, if any.
    pub fn inbound_session(
        &self,
        key: &InboundSessionKey,
    ) -> Result<Option<InboundGroupSession>, GroupSessionError> {
        Ok(self.store.load_inbound_session(key)?)
    }

    /// Ask our other devices for a session we cannot decrypt.
    ///
    /// Returns `None` if the session is already known or a request for it is
    /// already pending. The request is cancelled automatically once the
    /// session arrives by any route.
    pub async fn request_room_key(
        &self,
        room_id: &RoomId,
        sender_key: AgreementPublicKey,
        session_id: &str,
    ) -> Result<Option<OutgoingKeyRequest>, GroupSessionError> {
        let key = InboundSessionKey {
            room_id: room_id.clone(),
            sender_key,
            session_id: session_id.to_owned(),
        };
        if self.store.load_inbound_session(&key)?.is_some() {
            return Ok(None);
        }
        let Some(request) = self.key_requests.start(key, self.env.random_id(16)) else {
            return Ok(None);
        };

        let own_device = &self.devices.own_address().device_id;
        let content = ToDeviceContent::RoomKeyRequest(request.request(own_device));
        self.send_to_own_devices(&content).await;
        info!(room_id = %room_id, session_id, request_id = %request.request_id, "requested room key");
        Ok(Some(request))
    }

    /// Key requests still waiting for a session.
    pub fn pending_key_requests(&self) -> Vec<OutgoingKeyRequest> {
        self.key_requests.pending()
    }

    /// Drop the room's outbound session; the next message starts a new one.
    pub async fn discard_outbound(&self, room_id: &RoomId) -> bool {
        let Some(scope) = self.rooms.get(room_id) else {
            return false;
        };
        let discarded = scope.lock().await.outbound.take();
        if let Some(session) = &discarded {
            info!(room_id = %room_id, session_id = session.session_id(), reason = %RotationReason::Discarded, "discarded outbound group session");
        }
        discarded.is_some()
    }

    /// View of the room's outbound session.
    pub async fn outbound_session_info(&self, room_id: &RoomId) -> Option<OutboundSessionInfo> {
        let scope = self.rooms.get(room_id)?;
        let room = scope.lock().await;
        room.outbound.as_ref().map(OutboundGroupSession::info)
    }

    /// Devices among `room_devices` that may receive the room's session key.
    fn eligible_devices(
        &self,
        room_devices: &[DeviceAddress],
    ) -> Result<BTreeMap<DeviceAddress, DeviceIdentity>, GroupSessionError> {
        let own = self.devices.own_address();
        let mut eligible = BTreeMap::new();
        for address in room_devices.iter().filter(|address| *address != own) {
            let Some(device) = self.devices.device(address)? else {
                debug!(device = %address, "skipping device with unknown keys");
                continue;
            };
            if device.stale || device.is_blocked() {
                continue;
            }
            if self.config.only_share_with_verified && !device.is_verified() {
                debug!(device = %address, "skipping unverified device");
                continue;
            }
            eligible.insert(address.clone(), device);
        }
        Ok(eligible)
    }

    /// The room's usable outbound session, rotating or creating as needed.
    /// The flag is true if the session was created by this call.
    fn current_outbound<'a>(
        &self,
        room: &'a mut RoomScope<E::Instant>,
        room_id: &RoomId,
        audience: &BTreeSet<DeviceAddress>,
    ) -> Result<(&'a mut OutboundGroupSession<E::Instant>, bool), GroupSessionError> {
        let now = self.env.now();
        let reason =
            room.outbound.as_ref().and_then(|s| s.rotation_reason(now, audience, &self.config));
        if let Some(reason) = reason
            && let Some(old) = room.outbound.take()
        {
            info!(room_id = %room_id, session_id = old.session_id(), %reason, "rotating outbound group session");
        }

        match &mut room.outbound {
            Some(session) => Ok((session, false)),
            slot @ None => {
                let session = OutboundGroupSession::new(&self.env, self.crypto.as_ref(), room_id.clone());
                let own = self.devices.own_identity();
                let inbound = session.own_inbound(own.identity_key, own.signing_key)?;
                self.store.save_inbound_session(&inbound)?;
                debug!(room_id = %room_id, session_id = session.session_id(), "created outbound group session");
                Ok((slot.insert(session), true))
            },
        }
    }

    /// Deliver a session key to each target. Returns (delivered, failed).
    async fn share(
        &self,
        room_key: &RoomKeyContent,
        targets: &[DeviceAddress],
        eligible: &BTreeMap<DeviceAddress, DeviceIdentity>,
    ) -> (Vec<DeviceAddress>, Vec<DeviceAddress>) {
        let content = ToDeviceContent::RoomKey(room_key.clone());
        let mut delivered = Vec::with_capacity(targets.len());
        let mut failed = Vec::new();
        for target in targets {
            let Some(device) = eligible.get(target) else {
                continue;
            };
            match self.direct.send(device, &content, self.config.share_attempts).await {
                Ok(()) => delivered.push(target.clone()),
                Err(err) => {
                    warn!(
                        room_id = %room_key.room_id,
                        device = %target,
                        error = %err,
                        "room key share failed, withholding device"
                    );
                    failed.push(target.clone());
                },
            }
        }
        if !targets.is_empty() {
            debug!(
                room_id = %room_key.room_id,
                session_id = %room_key.session_id,
                delivered = delivered.len(),
                failed = failed.len(),
                "shared room key"
            );
        }
        (delivered, failed)
    }

    /// Store `session` unless our copy is at least as good. Serialized with
    /// the room so concurrent installs cannot lose the better copy.
    async fn install(&self, session: InboundGroupSession) -> Result<bool, GroupSessionError> {
        let key = session.key();
        let scope = self.rooms.get_or_insert_with(&key.room_id, RoomScope::default);
        let installed = {
            let _room = scope.lock().await;
            match self.store.load_inbound_session(&key)? {
                Some(existing) if !session.is_better_than(&existing) => false,
                _ => {
                    self.store.save_inbound_session(&session)?;
                    true
                },
            }
        };
        self.complete_key_request(&key).await;
        Ok(installed)
    }

    async fn complete_key_request(&self, key: &InboundSessionKey) {
        let Some(request) = self.key_requests.complete(key) else {
            return;
        };
        let own_device = &self.devices.own_address().device_id;
        let content = ToDeviceContent::RoomKeyRequest(request.cancellation(own_device));
        self.send_to_own_devices(&content).await;
        debug!(request_id = %request.request_id, session_id = %key.session_id, "cancelled room key request");
    }

    async fn send_to_own_devices(&self, content: &ToDeviceContent) {
        let own_user = &self.devices.own_address().user_id;
        let devices = match self.devices.user_devices(own_user) {
            Ok(devices) => devices,
            Err(err) => {
                error!(error = %err, "failed to load own devices");
                return;
            },
        };
        for device in devices.iter().filter(|d| !d.is_blocked() && !d.stale) {
            if let Err(err) = self.direct.send(device, content, self.config.share_attempts).await {
                warn!(device = %device.address(), kind = content.kind(), error = %err, "failed to reach own device");
            }
        }
    }
}
