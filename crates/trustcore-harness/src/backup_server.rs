//! In-memory backup server.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use trustcore_core::{
    backup::{BackedUpRoomKey, BackupVersion, NewBackupVersion},
    ids::RoomId,
    transport::{BackupTransport, TransportError},
};

#[derive(Default)]
struct ServerState {
    versions: Vec<BackupVersion>,
    deleted: bool,
    keys: BTreeMap<String, BTreeMap<(RoomId, String), BackedUpRoomKey>>,
    uploads_left: Option<usize>,
    upload_requests: usize,
    held_uploads: usize,
}

impl ServerState {
    fn current(&self) -> Option<&BackupVersion> {
        if self.deleted { None } else { self.versions.last() }
    }
}

/// Server side of key backup, shared by every device of a user.
///
/// Only the newest version accepts uploads. An upload keeps the stored copy
/// of a session unless the new one starts at a lower message index.
pub struct MemoryBackupServer {
    state: Mutex<ServerState>,
    hold: watch::Sender<bool>,
}

impl Default for MemoryBackupServer {
    fn default() -> Self {
        Self { state: Mutex::default(), hold: watch::Sender::new(false) }
    }
}

impl MemoryBackupServer {
    /// Server with no backup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every upload request before it is processed until
    /// [`Self::release_uploads`].
    pub fn hold_uploads(&self) {
        self.hold.send_replace(true);
    }

    /// Let parked and future uploads through.
    pub fn release_uploads(&self) {
        self.hold.send_replace(false);
    }

    /// Upload requests currently parked by [`Self::hold_uploads`].
    pub fn held_uploads(&self) -> usize {
        self.lock().held_uploads
    }

    /// Newest version, if backup is set up.
    pub fn current(&self) -> Option<BackupVersion> {
        self.lock().current().cloned()
    }

    /// Sessions stored under `version`.
    pub fn key_count(&self, version: &str) -> usize {
        self.lock().keys.get(version).map_or(0, BTreeMap::len)
    }

    /// Stored entries of `version`, for tampering tests.
    pub fn keys(&self, version: &str) -> Vec<BackedUpRoomKey> {
        self.lock().keys.get(version).map(|keys| keys.values().cloned().collect()).unwrap_or_default()
    }

    /// Overwrite the entries of `version`.
    pub fn replace_keys(&self, version: &str, keys: Vec<BackedUpRoomKey>) {
        let entries = keys
            .into_iter()
            .map(|key| ((key.room_id.clone(), key.session_id.clone()), key))
            .collect();
        self.lock().keys.insert(version.to_string(), entries);
    }

    /// Upload requests received, failed ones included.
    pub fn upload_requests(&self) -> usize {
        self.lock().upload_requests
    }

    /// Turn backup off; the next version created turns it back on.
    pub fn delete_backup(&self) {
        self.lock().deleted = true;
    }

    /// Accept `uploads` more upload requests, then time out every one until
    /// [`Self::heal`].
    pub fn fail_uploads_after(&self, uploads: usize) {
        self.lock().uploads_left = Some(uploads);
    }

    /// Accept every upload again.
    pub fn heal(&self) {
        self.lock().uploads_left = None;
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BackupTransport for MemoryBackupServer {
    async fn current_version(&self) -> Result<Option<BackupVersion>, TransportError> {
        Ok(self.current())
    }

    async fn create_version(&self, version: NewBackupVersion) -> Result<String, TransportError> {
        let mut state = self.lock();
        let id = (state.versions.len() + 1).to_string();
        state.versions.push(BackupVersion {
            version: id.clone(),
            algorithm: version.algorithm,
            auth_data: version.auth_data,
        });
        state.deleted = false;
        debug!(version = %id, "backup version created");
        Ok(id)
    }

    async fn upload_keys(
        &self,
        version: &str,
        keys: Vec<BackedUpRoomKey>,
    ) -> Result<(), TransportError> {
        let mut hold = self.hold.subscribe();
        if *hold.borrow_and_update() {
            self.lock().held_uploads += 1;
            let released = hold.wait_for(|held| !*held).await.is_ok();
            self.lock().held_uploads -= 1;
            if !released {
                return Err(TransportError::Timeout);
            }
        }

        let mut state = self.lock();
        state.upload_requests += 1;
        if state.current().is_none_or(|current| current.version != version) {
            return Err(TransportError::WrongBackupVersion(version.to_string()));
        }
        match &mut state.uploads_left {
            Some(0) => return Err(TransportError::Timeout),
            Some(left) => *left -= 1,
            None => {},
        }

        let stored = state.keys.entry(version.to_string()).or_default();
        for key in keys {
            let slot = (key.room_id.clone(), key.session_id.clone());
            match stored.get(&slot) {
                Some(existing) if existing.first_message_index <= key.first_message_index => {},
                _ => {
                    stored.insert(slot, key);
                },
            }
        }
        Ok(())
    }

    async fn download_keys(&self, version: &str) -> Result<Vec<BackedUpRoomKey>, TransportError> {
        let state = self.lock();
        if !state.versions.iter().any(|known| known.version == version) {
            return Err(TransportError::Rejected(format!("no backup version {version}")));
        }
        Ok(state.keys.get(version).map(|keys| keys.values().cloned().collect()).unwrap_or_default())
    }
}
