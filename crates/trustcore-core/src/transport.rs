//! Network collaborators.
//!
//! The core never performs HTTP itself. It hands opaque encrypted payloads to
//! a [`Transport`] and backup requests to a [`BackupTransport`]; request
//! execution, authentication and connection-level retry belong to the
//! implementation. The core only retries at the granularity it owns (one
//! device, one verification message).

use async_trait::async_trait;
use thiserror::Error;
use trustcore_crypto::AgreementPublicKey;

use crate::{
    backup::{BackedUpRoomKey, BackupVersion, NewBackupVersion},
    ids::{DeviceAddress, RoomId},
};

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Peer or server could not be reached
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Request did not complete in time
    #[error("request timed out")]
    Timeout,

    /// Server refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    /// Backup version on the server is not the one the request named
    #[error("backup version {0} is no longer current")]
    WrongBackupVersion(String),
}

impl TransportError {
    /// Returns true if the same request may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout)
    }
}

/// Delivery of encrypted to-device payloads and one-time key claims.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one encrypted payload to one device.
    async fn send_to_device(
        &self,
        recipient: &DeviceAddress,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Post a payload into a room timeline, returning its event id.
    ///
    /// Used for in-room verification requests.
    async fn send_to_room(&self, room_id: &RoomId, payload: Vec<u8>) -> Result<String, TransportError>;

    /// Claim one published one-time key of a device. `None` if it has none
    /// left.
    async fn claim_one_time_key(
        &self,
        device: &DeviceAddress,
    ) -> Result<Option<AgreementPublicKey>, TransportError>;
}

/// Server side of key backup.
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// Current backup version, `None` if backup is not set up.
    async fn current_version(&self) -> Result<Option<BackupVersion>, TransportError>;

    /// Create a new version, returning its id.
    async fn create_version(&self, version: NewBackupVersion) -> Result<String, TransportError>;

    /// Upload a batch of encrypted sessions to `version`.
    async fn upload_keys(
        &self,
        version: &str,
        keys: Vec<BackedUpRoomKey>,
    ) -> Result<(), TransportError>;

    /// Download every encrypted session stored under `version`.
    async fn download_keys(&self, version: &str) -> Result<Vec<BackedUpRoomKey>, TransportError>;
}

/// In-memory transport that records what was sent.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    #![allow(clippy::disallowed_types, reason = "Locking simple recording state")]

    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::{Mutex, PoisonError},
    };

    use async_trait::async_trait;
    use trustcore_crypto::AgreementPublicKey;

    use super::{Transport, TransportError};
    use crate::ids::{DeviceAddress, RoomId};

    #[derive(Default)]
    struct Recorded {
        to_device: Vec<(DeviceAddress, Vec<u8>)>,
        to_room: Vec<(RoomId, Vec<u8>)>,
        one_time_keys: BTreeMap<DeviceAddress, Vec<AgreementPublicKey>>,
        unreachable: BTreeSet<DeviceAddress>,
    }

    /// Records every payload instead of delivering it.
    ///
    /// Devices marked unreachable fail every send with a transient error.
    #[derive(Default)]
    pub struct RecordingTransport {
        recorded: Mutex<Recorded>,
    }

    impl RecordingTransport {
        /// Empty transport.
        pub fn new() -> Self {
            Self::default()
        }

        /// Make one-time keys claimable for `device`.
        pub fn publish_one_time_keys(&self, device: &DeviceAddress, keys: Vec<AgreementPublicKey>) {
            self.lock().one_time_keys.entry(device.clone()).or_default().extend(keys);
        }

        /// Fail every send to `device` until [`Self::set_reachable`].
        pub fn set_unreachable(&self, device: &DeviceAddress) {
            self.lock().unreachable.insert(device.clone());
        }

        /// Deliver to `device` again.
        pub fn set_reachable(&self, device: &DeviceAddress) {
            self.lock().unreachable.remove(device);
        }

        /// Drain recorded to-device payloads.
        pub fn take_to_device(&self) -> Vec<(DeviceAddress, Vec<u8>)> {
            std::mem::take(&mut self.lock().to_device)
        }

        /// Drain recorded room payloads.
        pub fn take_to_room(&self) -> Vec<(RoomId, Vec<u8>)> {
            std::mem::take(&mut self.lock().to_room)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
            self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_to_device(
            &self,
            recipient: &DeviceAddress,
            payload: Vec<u8>,
        ) -> Result<(), TransportError> {
            let mut recorded = self.lock();
            if recorded.unreachable.contains(recipient) {
                return Err(TransportError::Unreachable(recipient.to_string()));
            }
            recorded.to_device.push((recipient.clone(), payload));
            Ok(())
        }

        async fn send_to_room(&self, room_id: &RoomId, payload: Vec<u8>) -> Result<String, TransportError> {
            let mut recorded = self.lock();
            recorded.to_room.push((room_id.clone(), payload));
            Ok(format!("$event{}", recorded.to_room.len()))
        }

        async fn claim_one_time_key(
            &self,
            device: &DeviceAddress,
        ) -> Result<Option<AgreementPublicKey>, TransportError> {
            Ok(self.lock().one_time_keys.get_mut(device).and_then(Vec::pop))
        }
    }
}
