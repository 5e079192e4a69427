//! Storage wrapper that fails writes on demand.
//!
//! Reads always pass through. Writes fail with a transient `Io` error either
//! once a write budget is spent or at a seeded random rate, which is what
//! interrupted bulk imports and backup uploads look like to the core.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;
use trustcore_core::{
    devices::DeviceIdentity,
    group::{InboundGroupSession, InboundSessionKey},
    ids::{DeviceAddress, UserId},
    store::{CryptoStore, SessionCounts, StoreError},
};

struct Chaos {
    rng: ChaCha20Rng,
    failure_rate: f64,
    writes_left: Option<usize>,
    failures: usize,
}

/// [`CryptoStore`] wrapper with write fault injection.
///
/// Clones share the wrapped store and the fault plan.
#[derive(Clone)]
pub struct ChaoticStore<S: CryptoStore> {
    inner: S,
    chaos: Arc<Mutex<Chaos>>,
}

impl<S: CryptoStore> ChaoticStore<S> {
    /// Wrap `inner` with no faults planned.
    pub fn new(inner: S, seed: u64) -> Self {
        Self {
            inner,
            chaos: Arc::new(Mutex::new(Chaos {
                rng: ChaCha20Rng::seed_from_u64(seed),
                failure_rate: 0.0,
                writes_left: None,
                failures: 0,
            })),
        }
    }

    /// Let `writes` more writes succeed, then fail every write until
    /// [`Self::heal`].
    pub fn fail_after(&self, writes: usize) {
        self.lock().writes_left = Some(writes);
    }

    /// Fail each write with probability `rate`.
    pub fn set_failure_rate(&self, rate: f64) {
        self.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut chaos = self.lock();
        chaos.failure_rate = 0.0;
        chaos.writes_left = None;
    }

    /// Writes failed so far.
    pub fn failures(&self) -> usize {
        self.lock().failures
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lock(&self) -> MutexGuard<'_, Chaos> {
        self.chaos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, operation: &'static str) -> Result<(), StoreError> {
        let mut chaos = self.lock();
        let budget_spent = match &mut chaos.writes_left {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            },
            None => false,
        };
        let rate = chaos.failure_rate;
        if budget_spent || (rate > 0.0 && chaos.rng.gen_bool(rate)) {
            chaos.failures += 1;
            debug!(operation, failures = chaos.failures, "injected store failure");
            return Err(StoreError::Io(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

impl<S: CryptoStore> CryptoStore for ChaoticStore<S> {
    fn save_device(&self, device: &DeviceIdentity) -> Result<(), StoreError> {
        self.write("save_device")?;
        self.inner.save_device(device)
    }

    fn load_device(&self, address: &DeviceAddress) -> Result<Option<DeviceIdentity>, StoreError> {
        self.inner.load_device(address)
    }

    fn load_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceIdentity>, StoreError> {
        self.inner.load_user_devices(user_id)
    }

    fn save_inbound_session(&self, session: &InboundGroupSession) -> Result<(), StoreError> {
        self.write("save_inbound_session")?;
        self.inner.save_inbound_session(session)
    }

    fn load_inbound_session(
        &self,
        key: &InboundSessionKey,
    ) -> Result<Option<InboundGroupSession>, StoreError> {
        self.inner.load_inbound_session(key)
    }

    fn load_inbound_sessions(&self) -> Result<Vec<InboundGroupSession>, StoreError> {
        self.inner.load_inbound_sessions()
    }

    fn inbound_sessions_pending_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>, StoreError> {
        self.inner.inbound_sessions_pending_backup(limit)
    }

    fn mark_backed_up(&self, keys: &[InboundSessionKey]) -> Result<(), StoreError> {
        self.write("mark_backed_up")?;
        self.inner.mark_backed_up(keys)
    }

    fn reset_backup_state(&self) -> Result<(), StoreError> {
        self.write("reset_backup_state")?;
        self.inner.reset_backup_state()
    }

    fn inbound_session_counts(&self) -> Result<SessionCounts, StoreError> {
        self.inner.inbound_session_counts()
    }

    fn save_backup_version(&self, version: Option<&str>) -> Result<(), StoreError> {
        self.write("save_backup_version")?;
        self.inner.save_backup_version(version)
    }

    fn load_backup_version(&self) -> Result<Option<String>, StoreError> {
        self.inner.load_backup_version()
    }
}
