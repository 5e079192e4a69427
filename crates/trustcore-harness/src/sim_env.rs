//! Simulated environment shared by every device of a cluster.

use std::time::Duration;

use trustcore_core::env::{
    Environment,
    test_utils::{MockEnv, MockInstant},
};

/// Seeded RNG plus a virtual clock.
///
/// Clones share one clock and one RNG stream, so a cluster built from a seed
/// replays the same keys, ids and nonces every run. Sleeping advances the
/// clock and yields to the runtime, so timeout loops interleave with the
/// tasks they police instead of spinning.
#[derive(Clone, Default)]
pub struct SimEnv {
    inner: MockEnv,
}

impl SimEnv {
    /// Environment with the given seed, clock at zero.
    pub fn with_seed(seed: u64) -> Self {
        Self { inner: MockEnv::with_seed(seed) }
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) {
        self.inner.advance(by);
    }
}

impl Environment for SimEnv {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let inner = self.inner.clone();
        async move {
            inner.advance(duration);
            tokio::task::yield_now().await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.random_bytes(buffer);
    }
}
