//! Server-side key backup: version checks, uploads and recovery.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use trustcore_crypto::{AgreementPublicKey, AgreementSecret, CryptoPrimitives};

use super::{
    error::BackupError,
    passphrase::{PassphraseInfo, derive_key_from_passphrase, derive_key_with_info},
    recovery_key::RecoveryKey,
    session_data::{decrypt_session, encrypt_session},
    state::BackupState,
    version::{BACKUP_ALGORITHM, BackupAuthData, BackupVersion, NewBackupVersion},
};
use crate::{
    config::BackupConfig,
    devices::DeviceKeyStore,
    env::Environment,
    group::{GroupSessionManager, ImportResult, SessionOrigin},
    store::{CryptoStore, SessionCounts},
    transport::{BackupTransport, TransportError},
};

/// A freshly created backup and the key that opens it.
#[derive(Debug)]
pub struct CreatedBackup {
    /// Server-assigned version id
    pub version: String,
    /// Backup decryption key; show it to the user once
    pub recovery_key: RecoveryKey,
    /// KDF parameters, if the key came from a passphrase
    pub passphrase: Option<PassphraseInfo>,
}

#[derive(Debug, Clone)]
struct ActiveBackup {
    version: String,
    public_key: AgreementPublicKey,
}

fn is_current(active: Option<&ActiveBackup>, backup: &ActiveBackup) -> bool {
    active.is_some_and(|active| active.version == backup.version)
}

/// Uploads inbound group sessions to the server backup and restores them.
///
/// The active version is only locked while it is read or replaced, never
/// across a server round trip. Uploads run one at a time and re-check the
/// active version before recording a batch. Listeners follow progress
/// through [`Self::subscribe`].
pub struct KeyBackupManager<E: Environment, S: CryptoStore> {
    env: E,
    crypto: Arc<dyn CryptoPrimitives>,
    config: BackupConfig,
    store: S,
    devices: Arc<DeviceKeyStore<S>>,
    groups: Arc<GroupSessionManager<E, S>>,
    transport: Arc<dyn BackupTransport>,
    state: watch::Sender<BackupState>,
    active: Mutex<Option<ActiveBackup>>,
    uploading: Mutex<()>,
}

impl<E: Environment, S: CryptoStore> KeyBackupManager<E, S> {
    /// Create a manager in state `Unknown`.
    pub fn new(
        env: E,
        crypto: Arc<dyn CryptoPrimitives>,
        config: BackupConfig,
        store: S,
        devices: Arc<DeviceKeyStore<S>>,
        groups: Arc<GroupSessionManager<E, S>>,
        transport: Arc<dyn BackupTransport>,
    ) -> Self {
        let (state, _) = watch::channel(BackupState::Unknown);
        Self {
            env,
            crypto,
            config,
            store,
            devices,
            groups,
            transport,
            state,
            active: Mutex::new(None),
            uploading: Mutex::new(()),
        }
    }

    /// Current state.
    pub fn state(&self) -> BackupState {
        *self.state.borrow()
    }

    /// Listen for state changes. A receiver always reads the latest state,
    /// never a stale intermediate one.
    pub fn subscribe(&self) -> watch::Receiver<BackupState> {
        self.state.subscribe()
    }

    /// Sessions in the store, and how many of them are backed up.
    pub fn progress(&self) -> Result<SessionCounts, BackupError> {
        Ok(self.store.inbound_session_counts()?)
    }

    /// Create a new backup version and make it current.
    ///
    /// With a passphrase the key is derived from it, otherwise a random key
    /// is generated. Every stored session is queued for upload.
    pub async fn create_backup(&self, passphrase: Option<&str>) -> Result<CreatedBackup, BackupError> {
        let (recovery_key, info) = match passphrase {
            Some(passphrase) => {
                let material = derive_key_from_passphrase(
                    &self.env,
                    self.crypto.as_ref(),
                    passphrase,
                    self.config.passphrase_iterations,
                )?;
                (material.key, Some(material.info))
            },
            None => (RecoveryKey::from_bytes(self.env.random_key()), None),
        };
        let public_key = self.public_key(&recovery_key);
        let auth_data =
            BackupAuthData::signed(self.crypto.as_ref(), self.devices.account(), public_key, info.clone());

        let version = self
            .transport
            .create_version(NewBackupVersion { algorithm: BACKUP_ALGORITHM.to_string(), auth_data })
            .await?;
        info!(%version, "created backup version");
        self.activate(&mut *self.active.lock().await, version.clone(), public_key)?;
        Ok(CreatedBackup { version, recovery_key, passphrase: info })
    }

    /// Fetch the server's backup version and decide whether we can upload
    /// to it.
    ///
    /// A version we have not uploaded to before resets every session's
    /// backed-up flag so everything is uploaded again.
    pub async fn check_backup_version(&self) -> Result<BackupState, BackupError> {
        let current = match self.transport.current_version().await {
            Ok(current) => current,
            Err(err) => {
                warn!(error = %err, "backup version check failed");
                return Err(err.into());
            },
        };

        let mut active = self.active.lock().await;
        let Some(version) = current else {
            *active = None;
            self.set_state(BackupState::Disabled);
            return Ok(BackupState::Disabled);
        };
        if version.algorithm != BACKUP_ALGORITHM {
            warn!(version = %version.version, algorithm = %version.algorithm, "unsupported backup algorithm");
            *active = None;
            self.set_state(BackupState::WrongBackupVersion);
            return Ok(BackupState::WrongBackupVersion);
        }
        if !version.auth_data.is_trusted(self.crypto.as_ref(), &self.devices, &version.algorithm)? {
            warn!(version = %version.version, "backup is not signed by a trusted device");
            *active = None;
            self.set_state(BackupState::NotTrusted);
            return Ok(BackupState::NotTrusted);
        }

        self.activate(&mut active, version.version, version.auth_data.public_key)?;
        Ok(self.state())
    }

    /// Inbound sessions may have been stored; queue them for upload.
    pub fn sessions_added(&self) {
        if self.state() != BackupState::ReadyToBackUp {
            return;
        }
        match self.store.inbound_session_counts() {
            Ok(counts) if counts.backed_up < counts.total => self.set_state(BackupState::WillBackUp),
            Ok(_) => {},
            Err(err) => error!(error = %err, "failed to count sessions pending backup"),
        }
    }

    /// Upload every session not yet backed up, in batches.
    ///
    /// Each batch is marked backed up once the server accepted it, so an
    /// interrupted run resumes where it stopped. Returns the number of
    /// sessions uploaded.
    ///
    /// # Errors
    ///
    /// - `NotEnabled` if no trusted backup version is current
    /// - `Transport` if an upload failed; earlier batches stay committed
    /// - `Store` if a batch could not be marked; it is uploaded again next run
    ///
    /// If another version becomes current mid-run, the batch in flight is
    /// not recorded and the new version's state is left alone.
    pub async fn backup_keys(&self) -> Result<usize, BackupError> {
        let _uploading = self.uploading.lock().await;
        let Some(backup) = self.active.lock().await.clone() else {
            return Err(BackupError::NotEnabled(self.state()));
        };

        let mut uploaded = 0;
        let outcome = self.upload_pending(&backup, &mut uploaded).await;
        let mut active = self.active.lock().await;
        if !is_current(active.as_ref(), &backup) {
            info!(version = %backup.version, uploaded, "backup version replaced during upload");
            return outcome.map(|()| uploaded);
        }
        match outcome {
            Ok(()) => {
                self.set_state(BackupState::ReadyToBackUp);
                if uploaded > 0 {
                    info!(version = %backup.version, uploaded, "backup complete");
                }
                Ok(uploaded)
            },
            Err(err) => {
                warn!(version = %backup.version, error = %err, uploaded, "backup upload failed");
                if matches!(err, BackupError::Transport(TransportError::WrongBackupVersion(_))) {
                    *active = None;
                    self.set_state(BackupState::Unknown);
                } else {
                    self.set_state(BackupState::ReadyToBackUp);
                }
                Err(err)
            },
        }
    }

    /// Returns early without error once `backup` stops being current.
    async fn upload_pending(&self, backup: &ActiveBackup, uploaded: &mut usize) -> Result<(), BackupError> {
        loop {
            let pending = {
                let active = self.active.lock().await;
                if !is_current(active.as_ref(), backup) {
                    return Ok(());
                }
                let pending = self.store.inbound_sessions_pending_backup(self.config.batch_size.max(1))?;
                if pending.is_empty() {
                    return Ok(());
                }
                if self.state() != BackupState::BackingUp {
                    self.set_state(BackupState::WillBackUp);
                    self.set_state(BackupState::BackingUp);
                }
                pending
            };

            let mut batch = Vec::with_capacity(pending.len());
            for session in &pending {
                batch.push(encrypt_session(&self.env, self.crypto.as_ref(), &backup.public_key, &session.export())?);
            }
            self.transport.upload_keys(&backup.version, batch).await?;

            let keys: Vec<_> = pending.iter().map(|session| session.key()).collect();
            {
                let active = self.active.lock().await;
                if !is_current(active.as_ref(), backup) {
                    debug!(version = %backup.version, batch = keys.len(), "backup version replaced, batch not recorded");
                    return Ok(());
                }
                self.store.mark_backed_up(&keys)?;
            }
            *uploaded += keys.len();
            debug!(version = %backup.version, batch = keys.len(), uploaded = *uploaded, "uploaded backup batch");
        }
    }

    /// Restore every session in the current backup using a recovery key.
    ///
    /// `progress` is called with `(processed, total)` after every session.
    /// Restoring is idempotent; running it again after an interruption
    /// imports whatever is still missing.
    pub async fn restore_with_recovery_key(
        &self,
        recovery_key: &str,
        progress: impl FnMut(usize, usize) + Send,
    ) -> Result<ImportResult, BackupError> {
        let key = RecoveryKey::decode(recovery_key).ok_or(BackupError::InvalidRecoveryKey)?;
        let version = self.current_version().await?;
        self.restore(version, &key, progress).await
    }

    /// Restore every session in the current backup using its passphrase.
    pub async fn restore_with_passphrase(
        &self,
        passphrase: &str,
        progress: impl FnMut(usize, usize) + Send,
    ) -> Result<ImportResult, BackupError> {
        let version = self.current_version().await?;
        let info = version.auth_data.passphrase.clone().ok_or(BackupError::NoPassphrase)?;
        let key = derive_key_with_info(self.crypto.as_ref(), passphrase, &info)?;
        self.restore(version, &key, progress).await
    }

    async fn current_version(&self) -> Result<BackupVersion, BackupError> {
        let version = self.transport.current_version().await?.ok_or(BackupError::NoBackup)?;
        if version.algorithm != BACKUP_ALGORITHM {
            return Err(BackupError::UnsupportedAlgorithm(version.algorithm));
        }
        Ok(version)
    }

    /// Holding the key proves the backup is ours, so a successful restore
    /// also makes its version current.
    async fn restore(
        &self,
        version: BackupVersion,
        key: &RecoveryKey,
        progress: impl FnMut(usize, usize) + Send,
    ) -> Result<ImportResult, BackupError> {
        let public_key = self.public_key(key);
        if public_key != version.auth_data.public_key {
            return Err(BackupError::KeyMismatch);
        }

        let entries = self.transport.download_keys(&version.version).await?;
        self.activate(&mut *self.active.lock().await, version.version.clone(), public_key)?;

        let secret = AgreementSecret::from_bytes(*key.as_bytes());
        let mut exports = Vec::with_capacity(entries.len());
        for entry in &entries {
            match decrypt_session(self.crypto.as_ref(), &secret, entry) {
                Ok(export) => exports.push(export),
                Err(err) => {
                    warn!(room_id = %entry.room_id, session_id = %entry.session_id, error = %err, "skipping undecryptable backup entry");
                },
            }
        }

        let result = self.groups.import_inbound_sessions(&exports, SessionOrigin::Backup, progress).await?;
        info!(
            version = %version.version,
            downloaded = entries.len(),
            imported = result.imported_count,
            "restored sessions from backup"
        );
        Ok(result)
    }

    fn activate(
        &self,
        active: &mut Option<ActiveBackup>,
        version: String,
        public_key: AgreementPublicKey,
    ) -> Result<(), BackupError> {
        if self.store.load_backup_version()?.as_deref() != Some(version.as_str()) {
            info!(%version, "backup version changed, re-uploading every session");
            self.store.reset_backup_state()?;
            self.store.save_backup_version(Some(&version))?;
        }
        *active = Some(ActiveBackup { version, public_key });

        self.set_state(BackupState::ReadyToBackUp);
        let counts = self.store.inbound_session_counts()?;
        if counts.backed_up < counts.total {
            self.set_state(BackupState::WillBackUp);
        }
        Ok(())
    }

    fn public_key(&self, key: &RecoveryKey) -> AgreementPublicKey {
        self.crypto.agreement_public_key(&AgreementSecret::from_bytes(*key.as_bytes()))
    }

    fn set_state(&self, next: BackupState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                warn!(from = %state, to = %next, "unexpected backup state change");
            }
            debug!(from = %state, to = %next, "backup state");
            *state = next;
            true
        });
    }
}
