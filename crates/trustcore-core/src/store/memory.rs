#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{CryptoStore, SessionCounts, StoreError};
use crate::{
    devices::DeviceIdentity,
    group::{InboundGroupSession, InboundSessionKey},
    ids::{DeviceAddress, UserId},
};

/// In-memory store for tests, simulation and ephemeral clients.
///
/// All state sits behind one `Arc<Mutex<_>>`, so clones share it. Ordered
/// maps keep iteration deterministic, which the simulation harness relies on
/// when replaying a seed.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    devices: BTreeMap<DeviceAddress, DeviceIdentity>,
    inbound: BTreeMap<InboundSessionKey, InboundGroupSession>,
    backup_version: Option<String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored device identities.
    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        // Every mutation is a single map operation, so a panicking holder
        // cannot leave a half-written record behind.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CryptoStore for MemoryStore {
    fn save_device(&self, device: &DeviceIdentity) -> Result<(), StoreError> {
        self.lock().devices.insert(device.address(), device.clone());
        Ok(())
    }

    fn load_device(&self, address: &DeviceAddress) -> Result<Option<DeviceIdentity>, StoreError> {
        Ok(self.lock().devices.get(address).cloned())
    }

    fn load_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceIdentity>, StoreError> {
        let inner = self.lock();
        Ok(inner.devices.values().filter(|device| device.user_id == *user_id).cloned().collect())
    }

    fn save_inbound_session(&self, session: &InboundGroupSession) -> Result<(), StoreError> {
        self.lock().inbound.insert(session.key(), session.clone());
        Ok(())
    }

    fn load_inbound_session(
        &self,
        key: &InboundSessionKey,
    ) -> Result<Option<InboundGroupSession>, StoreError> {
        Ok(self.lock().inbound.get(key).cloned())
    }

    fn load_inbound_sessions(&self) -> Result<Vec<InboundGroupSession>, StoreError> {
        Ok(self.lock().inbound.values().cloned().collect())
    }

    fn inbound_sessions_pending_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>, StoreError> {
        let inner = self.lock();
        Ok(inner.inbound.values().filter(|s| !s.is_backed_up()).take(limit).cloned().collect())
    }

    fn mark_backed_up(&self, keys: &[InboundSessionKey]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for key in keys {
            if let Some(session) = inner.inbound.get_mut(key) {
                session.set_backed_up(true);
            }
        }
        Ok(())
    }

    fn reset_backup_state(&self) -> Result<(), StoreError> {
        for session in self.lock().inbound.values_mut() {
            session.set_backed_up(false);
        }
        Ok(())
    }

    fn inbound_session_counts(&self) -> Result<SessionCounts, StoreError> {
        let inner = self.lock();
        let backed_up = inner.inbound.values().filter(|s| s.is_backed_up()).count();
        Ok(SessionCounts { total: inner.inbound.len(), backed_up })
    }

    fn save_backup_version(&self, version: Option<&str>) -> Result<(), StoreError> {
        self.lock().backup_version = version.map(str::to_owned);
        Ok(())
    }

    fn load_backup_version(&self) -> Result<Option<String>, StoreError> {
        Ok(self.lock().backup_version.clone())
    }
}

#[cfg(test)]
mod tests {
    use trustcore_crypto::{AgreementPublicKey, SigningPublicKey};

    use super::*;
    use crate::{
        devices::TrustState,
        group::{ExportedRoomKey, SessionOrigin},
        ids::{DeviceId, RoomId},
        ratchet::RatchetSnapshot,
    };

    fn device(user: &str, device: &str) -> DeviceIdentity {
        DeviceIdentity {
            user_id: UserId::from(user),
            device_id: DeviceId::from(device),
            identity_key: AgreementPublicKey::from_bytes([1; 32]),
            signing_key: SigningPublicKey::from_bytes([2; 32]),
            trust: TrustState::Unknown,
            stale: false,
        }
    }

    fn session(session_byte: u8) -> InboundGroupSession {
        let signing_key = SigningPublicKey::from_bytes([session_byte; 32]);
        let export = ExportedRoomKey {
            room_id: RoomId::from("!room"),
            sender_key: AgreementPublicKey::from_bytes([9; 32]),
            session_id: hex::encode(signing_key.as_bytes()),
            session_key: RatchetSnapshot { index: 0, chain_key: [session_byte; 32] },
            signing_key,
            sender_claimed_signing_key: Some(SigningPublicKey::from_bytes([3; 32])),
        };
        InboundGroupSession::from_export(&export, SessionOrigin::Import).unwrap()
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.save_device(&device("@a", "A1")).unwrap();
        assert_eq!(clone.device_count(), 1);
    }

    #[test]
    fn user_devices_filter_by_user() {
        let store = MemoryStore::new();
        store.save_device(&device("@a", "A1")).unwrap();
        store.save_device(&device("@a", "A2")).unwrap();
        store.save_device(&device("@b", "B1")).unwrap();

        let devices = store.load_user_devices(&UserId::from("@a")).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.user_id == UserId::from("@a")));
    }

    #[test]
    fn backup_flags_mark_and_reset() {
        let store = MemoryStore::new();
        let first = session(1);
        let second = session(2);
        store.save_inbound_session(&first).unwrap();
        store.save_inbound_session(&second).unwrap();

        assert_eq!(store.inbound_sessions_pending_backup(10).unwrap().len(), 2);
        assert_eq!(store.inbound_sessions_pending_backup(1).unwrap().len(), 1);

        store.mark_backed_up(&[first.key()]).unwrap();
        let pending = store.inbound_sessions_pending_backup(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key(), second.key());
        assert_eq!(store.inbound_session_counts().unwrap(), SessionCounts { total: 2, backed_up: 1 });

        store.reset_backup_state().unwrap();
        assert_eq!(store.inbound_session_counts().unwrap().backed_up, 0);
    }

    #[test]
    fn backup_version_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_backup_version().unwrap(), None);
        store.save_backup_version(Some("7")).unwrap();
        assert_eq!(store.load_backup_version().unwrap().as_deref(), Some("7"));
        store.save_backup_version(None).unwrap();
        assert_eq!(store.load_backup_version().unwrap(), None);
    }
}
