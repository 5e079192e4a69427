//! Backup progress as seen by listeners.

use std::fmt;

/// Where key backup stands.
///
/// ```text
/// Unknown ──► Disabled | WrongBackupVersion | NotTrusted | ReadyToBackUp
/// ReadyToBackUp ──► WillBackUp ──► BackingUp ──► ReadyToBackUp
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupState {
    /// Server version not checked yet
    Unknown,
    /// No backup on the server
    Disabled,
    /// Server backup uses an algorithm we cannot write
    WrongBackupVersion,
    /// Server backup is not signed by any device we trust
    NotTrusted,
    /// Every session is backed up
    ReadyToBackUp,
    /// Sessions are waiting to be uploaded
    WillBackUp,
    /// Upload in progress
    BackingUp,
}

impl BackupState {
    /// No progress is possible without outside action.
    pub fn is_stuck(self) -> bool {
        matches!(self, Self::Unknown | Self::Disabled | Self::WrongBackupVersion | Self::NotTrusted)
    }

    /// Sessions are being, or will be, backed up.
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::ReadyToBackUp | Self::WillBackUp | Self::BackingUp)
    }

    /// Whether moving to `next` follows the state diagram. Re-entering the
    /// current state is always allowed, and a version check may move any
    /// state back to one of its outcomes.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match next {
            Self::Unknown => true,
            Self::Disabled | Self::WrongBackupVersion | Self::NotTrusted => !matches!(self, Self::BackingUp),
            Self::ReadyToBackUp => true,
            Self::WillBackUp => self == Self::ReadyToBackUp,
            Self::BackingUp => self == Self::WillBackUp,
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
            Self::WrongBackupVersion => "wrong backup version",
            Self::NotTrusted => "not trusted",
            Self::ReadyToBackUp => "ready to back up",
            Self::WillBackUp => "will back up",
            Self::BackingUp => "backing up",
        };
        f.write_str(name)
    }
}
