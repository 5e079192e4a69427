//! Command errors.

use thiserror::Error;
use trustcore_core::{BackupError, MachineError, VerificationError, devices::DeviceKeyError};
use trustcore_crypto::CryptoError;

/// Anything that stops a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// Text is not a recovery key
    #[error("not a valid recovery key")]
    InvalidRecoveryKey,

    /// Passphrase derivation failed
    #[error("key derivation failed: {0}")]
    Crypto(#[from] CryptoError),

    /// Device setup failed
    #[error(transparent)]
    Device(#[from] DeviceKeyError),

    /// Verification failed
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Backup or restore failed
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Sharing or decrypting a room message failed
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// A simulated step did not end as expected
    #[error("simulation stopped: {0}")]
    Simulation(String),

    /// Writing output failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
