//! One device's trust core: every component wired together, with decrypted
//! to-device content routed to the component that owns it.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info};
use trustcore_crypto::CryptoPrimitives;

use crate::{
    backup::KeyBackupManager,
    codec,
    config::MachineConfig,
    devices::{DeviceKeyStore, LocalAccount, SignedDeviceKeys},
    direct::{DecryptedToDevice, DirectSessionCodec},
    env::Environment,
    error::MachineError,
    group::{GroupSessionManager, KeyRequestAction, RoomCiphertext},
    ids::{DeviceAddress, RoomId, UserId},
    messages::{RawContent, ToDeviceContent},
    store::CryptoStore,
    transport::{BackupTransport, Transport},
    verification::{PendingVerificationRequest, VerificationEngine, VerificationMessage},
};

/// The trust core of one device.
///
/// Owns a device key store, the pairwise codec, the group session manager,
/// the verification engine and the backup manager. Each component stays
/// reachable for the calls this facade does not wrap.
pub struct Machine<E: Environment, S: CryptoStore> {
    crypto: Arc<dyn CryptoPrimitives>,
    devices: Arc<DeviceKeyStore<S>>,
    direct: Arc<DirectSessionCodec<E, S>>,
    groups: Arc<GroupSessionManager<E, S>>,
    verification: Arc<VerificationEngine<E, S>>,
    backup: Arc<KeyBackupManager<E, S>>,
}

impl<E: Environment, S: CryptoStore> Machine<E, S> {
    /// Wire up every component for `account`.
    pub fn new(
        env: E,
        crypto: Arc<dyn CryptoPrimitives>,
        config: MachineConfig,
        account: LocalAccount,
        store: S,
        transport: Arc<dyn Transport>,
        backup_transport: Arc<dyn BackupTransport>,
    ) -> Self {
        let devices = Arc::new(DeviceKeyStore::new(account, store.clone(), Arc::clone(&crypto)));
        let direct = Arc::new(DirectSessionCodec::new(
            env.clone(),
            Arc::clone(&crypto),
            Arc::clone(&devices),
            Arc::clone(&transport),
        ));
        let groups = Arc::new(GroupSessionManager::new(
            env.clone(),
            Arc::clone(&crypto),
            config.group,
            store.clone(),
            Arc::clone(&devices),
            Arc::clone(&direct),
        ));
        let verification = Arc::new(VerificationEngine::new(
            env.clone(),
            Arc::clone(&crypto),
            config.verification,
            Arc::clone(&devices),
            Arc::clone(&direct),
            transport,
        ));
        let backup = Arc::new(KeyBackupManager::new(
            env,
            Arc::clone(&crypto),
            config.backup,
            store,
            Arc::clone(&devices),
            Arc::clone(&groups),
            backup_transport,
        ));
        info!(device = %devices.own_address(), "trust core ready");
        Self { crypto, devices, direct, groups, verification, backup }
    }

    /// This device's address.
    pub fn own_address(&self) -> &DeviceAddress {
        self.devices.own_address()
    }

    /// Self-signed keys to publish for this device.
    pub fn device_keys(&self) -> SignedDeviceKeys {
        self.devices.account().device_keys(self.crypto.as_ref())
    }

    /// Device identities and trust.
    pub fn devices(&self) -> &Arc<DeviceKeyStore<S>> {
        &self.devices
    }

    /// Pairwise channels.
    pub fn direct(&self) -> &Arc<DirectSessionCodec<E, S>> {
        &self.direct
    }

    /// Room sessions.
    pub fn groups(&self) -> &Arc<GroupSessionManager<E, S>> {
        &self.groups
    }

    /// Interactive verification.
    pub fn verification(&self) -> &Arc<VerificationEngine<E, S>> {
        &self.verification
    }

    /// Key backup.
    pub fn backup(&self) -> &Arc<KeyBackupManager<E, S>> {
        &self.backup
    }

    /// Decrypt a to-device payload and hand its content to the component
    /// that owns it.
    ///
    /// Returns the decrypted content for callers that want to inspect it.
    /// Incoming key requests from other devices are logged and not answered.
    ///
    /// # Errors
    ///
    /// - `Direct` if the payload does not decrypt or its bindings fail
    /// - `Group` if a room key cannot be installed
    /// - `Verification` if a verification reply cannot be delivered
    pub async fn receive_to_device(
        &self,
        sender_user: &UserId,
        payload: &[u8],
    ) -> Result<DecryptedToDevice, MachineError> {
        let decrypted = self.direct.decrypt(sender_user, payload).await?;
        let sender = &decrypted.sender;
        match &decrypted.content {
            ToDeviceContent::RoomKey(content) => {
                if self.groups.receive_room_key(sender, content).await? {
                    self.backup.sessions_added();
                }
            },
            ToDeviceContent::RoomKeyRequest(content) => match content.action {
                KeyRequestAction::Request => {
                    info!(device = %sender.address(), request_id = %content.request_id, "room key request from other device not answered");
                },
                KeyRequestAction::RequestCancellation => {
                    debug!(device = %sender.address(), request_id = %content.request_id, "room key request withdrawn");
                },
            },
            ToDeviceContent::Verification(message) => {
                self.verification.receive(sender, message).await?;
            },
            ToDeviceContent::Unknown(kind) => {
                debug!(device = %sender.address(), %kind, "ignoring unknown to-device content");
            },
        }
        Ok(decrypted)
    }

    /// Look at a room event for a verification request.
    ///
    /// Returns the new request if the event was one addressed by another
    /// device, `None` for every other event.
    pub fn receive_room_event(
        &self,
        sender_user: &UserId,
        room_id: &RoomId,
        event_id: &str,
        payload: &[u8],
    ) -> Result<Option<PendingVerificationRequest>, MachineError> {
        let raw: RawContent = codec::decode(payload)?;
        let ToDeviceContent::Verification(VerificationMessage::Request(content)) = ToDeviceContent::from_raw(&raw)?
        else {
            return Ok(None);
        };
        Ok(self.verification.receive_room_request(sender_user, room_id, event_id, &content)?)
    }

    /// Encrypt a room message, sharing the session key first where needed.
    pub async fn encrypt_room_message(
        &self,
        room_id: &RoomId,
        plaintext: &[u8],
        room_devices: &[DeviceAddress],
    ) -> Result<RoomCiphertext, MachineError> {
        let ciphertext = self.groups.encrypt(room_id, plaintext, room_devices).await?;
        // A new outbound session installs our own inbound copy.
        self.backup.sessions_added();
        Ok(ciphertext)
    }

    /// Decrypt a room message.
    pub fn decrypt_room_message(
        &self,
        room_id: &RoomId,
        message: &RoomCiphertext,
    ) -> Result<Vec<u8>, MachineError> {
        Ok(self.groups.decrypt(room_id, message)?)
    }

    /// Cancel expired verifications every `period`. Never returns.
    pub async fn run_verification_timeouts(&self, period: Duration) {
        self.verification.run_timeouts(period).await;
    }
}
