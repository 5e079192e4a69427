//! Tunables for each component.

use std::time::Duration;

use crate::verification::VerificationMethod;

/// Default age after which an outbound group session is replaced (7 days)
pub const DEFAULT_ROTATION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default number of messages after which an outbound group session is
/// replaced
pub const DEFAULT_ROTATION_MESSAGE_COUNT: u32 = 100;

/// Default delivery attempts per device when sharing a session key
pub const DEFAULT_SHARE_ATTEMPTS: u32 = 3;

/// Default lifetime of a verification transaction or request (10 minutes)
pub const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default time a finished verification stays known, so late `done` and
/// `cancel` messages still find it (2 minutes)
pub const DEFAULT_FINISHED_VERIFICATION_RETENTION: Duration = Duration::from_secs(2 * 60);

/// Default PBKDF2 iteration count for backup passphrases (2^20)
pub const DEFAULT_PASSPHRASE_ITERATIONS: u32 = 1 << 20;

/// Lowest iteration count accepted when deriving a new passphrase key
pub const MIN_PASSPHRASE_ITERATIONS: u32 = 1 << 20;

/// Default number of sessions per backup upload request
pub const DEFAULT_BACKUP_BATCH_SIZE: usize = 100;

/// Group session sharing and rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSessionConfig {
    /// Maximum session age
    pub rotation_period: Duration,
    /// Maximum messages per session
    pub rotation_message_count: u32,
    /// Delivery attempts per device before the device is withheld
    pub share_attempts: u32,
    /// Share only with verified devices instead of all non-blocked devices
    pub only_share_with_verified: bool,
}

impl Default for GroupSessionConfig {
    fn default() -> Self {
        Self {
            rotation_period: DEFAULT_ROTATION_PERIOD,
            rotation_message_count: DEFAULT_ROTATION_MESSAGE_COUNT,
            share_attempts: DEFAULT_SHARE_ATTEMPTS,
            only_share_with_verified: false,
        }
    }
}

/// Verification methods and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    /// Methods advertised in requests and ready messages
    pub methods: Vec<VerificationMethod>,
    /// Lifetime of a started transaction
    pub transaction_timeout: Duration,
    /// Lifetime of a request that was never started
    pub request_timeout: Duration,
    /// Delivery attempts per verification message
    pub send_attempts: u32,
    /// How long a finished request or transaction is kept before it is
    /// forgotten
    pub finished_retention: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            methods: VerificationMethod::ALL.to_vec(),
            transaction_timeout: DEFAULT_VERIFICATION_TIMEOUT,
            request_timeout: DEFAULT_VERIFICATION_TIMEOUT,
            send_attempts: DEFAULT_SHARE_ATTEMPTS,
            finished_retention: DEFAULT_FINISHED_VERIFICATION_RETENTION,
        }
    }
}

/// Key backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Sessions per upload request
    pub batch_size: usize,
    /// PBKDF2 iterations for new passphrase-derived keys
    pub passphrase_iterations: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BACKUP_BATCH_SIZE,
            passphrase_iterations: DEFAULT_PASSPHRASE_ITERATIONS,
        }
    }
}

/// Configuration for every component of a [`Machine`](crate::Machine).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineConfig {
    /// Group sessions
    pub group: GroupSessionConfig,
    /// Verification
    pub verification: VerificationConfig,
    /// Key backup
    pub backup: BackupConfig,
}
