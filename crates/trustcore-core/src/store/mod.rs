//! Persistence abstraction for device identities and inbound group sessions.
//!
//! The trait is synchronous and every method is atomic for the single record
//! it touches. Components read through the store before acting and write back
//! after each mutation, so a crash between two items of a bulk operation
//! leaves all earlier items committed.
//!
//! Outbound group sessions and pairwise ratchets are kept in memory by their
//! owners; a restarted client rotates its outbound sessions on first use.

mod error;
mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;

use crate::{
    devices::DeviceIdentity,
    group::{InboundGroupSession, InboundSessionKey},
    ids::{DeviceAddress, UserId},
};

/// Count of stored inbound sessions, split by backup status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    /// All inbound sessions
    pub total: usize,
    /// Sessions already uploaded to the current backup version
    pub backed_up: usize,
}

/// Storage abstraction for the trust core.
///
/// Must be Clone (each component holds its own handle), Send + Sync, and
/// synchronous. Implementations share internal state via Arc, so clones access
/// the same underlying storage.
pub trait CryptoStore: Clone + Send + Sync + 'static {
    /// Insert or overwrite a device identity keyed by (user, device).
    fn save_device(&self, device: &DeviceIdentity) -> Result<(), StoreError>;

    /// Load one device identity.
    fn load_device(&self, address: &DeviceAddress) -> Result<Option<DeviceIdentity>, StoreError>;

    /// All known devices of a user. Order is not guaranteed.
    fn load_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceIdentity>, StoreError>;

    /// Insert or overwrite an inbound session keyed by (room, sender key,
    /// session id).
    fn save_inbound_session(&self, session: &InboundGroupSession) -> Result<(), StoreError>;

    /// Load one inbound session.
    fn load_inbound_session(
        &self,
        key: &InboundSessionKey,
    ) -> Result<Option<InboundGroupSession>, StoreError>;

    /// Every stored inbound session.
    fn load_inbound_sessions(&self) -> Result<Vec<InboundGroupSession>, StoreError>;

    /// Up to `limit` sessions not yet marked backed up.
    fn inbound_sessions_pending_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>, StoreError>;

    /// Set `backed_up` on the given sessions. Missing keys are ignored.
    fn mark_backed_up(&self, keys: &[InboundSessionKey]) -> Result<(), StoreError>;

    /// Clear `backed_up` on every session, after the backup version changed.
    fn reset_backup_state(&self) -> Result<(), StoreError>;

    /// Session totals for progress reporting.
    fn inbound_session_counts(&self) -> Result<SessionCounts, StoreError>;

    /// Remember the backup version sessions are currently uploaded to.
    fn save_backup_version(&self, version: Option<&str>) -> Result<(), StoreError>;

    /// Backup version recorded by [`Self::save_backup_version`].
    fn load_backup_version(&self) -> Result<Option<String>, StoreError>;
}
