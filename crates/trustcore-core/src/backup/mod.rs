//! Encrypted server-side key backup and recovery.
//!
//! Inbound group sessions are sealed one by one to a backup public key and
//! uploaded in batches. The matching secret is the recovery key: shown to
//! the user as base58 text, or derived from a passphrase. A server version
//! is only written to when this device or one of its owner's verified
//! devices signed it.

mod error;
mod manager;
mod passphrase;
mod recovery_key;
mod session_data;
mod state;
mod version;

pub use error::BackupError;
pub use manager::{CreatedBackup, KeyBackupManager};
pub use passphrase::{
    PassphraseInfo, RecoveryKeyMaterial, derive_key_from_passphrase, derive_key_with_info,
};
pub use recovery_key::{RECOVERY_KEY_HEADER, RecoveryKey};
pub use session_data::{BackedUpRoomKey, EncryptedSessionData};
pub use state::BackupState;
pub use version::{BACKUP_ALGORITHM, BackupAuthData, BackupVersion, NewBackupVersion};
