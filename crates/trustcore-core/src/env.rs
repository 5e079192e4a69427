//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Session
//! rotation ages, verification timeouts, nonces, session ids and every secret
//! key flow through this trait, so a seeded environment replays an entire
//! verification or rotation scenario byte for byte.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, while simulation
    /// environments use a manually advanced virtual clock.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (timeout watchdogs) awaits this; protocol logic takes
    /// `now()` as input instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// 32 random bytes, the size of every secret key in this crate.
    fn random_key(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random lowercase-hex identifier of `len` bytes of entropy.
    ///
    /// Used for transaction ids, request ids and backup salts.
    fn random_id(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len];
        self.random_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// Deterministic environment for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    #![allow(clippy::disallowed_types, reason = "Locking simple RNG and clock state")]

    use std::{
        ops::Sub,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Virtual instant: time elapsed since the mock clock was created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct MockInstant(Duration);

    impl Sub for MockInstant {
        type Output = Duration;

        fn sub(self, rhs: Self) -> Duration {
            self.0.saturating_sub(rhs.0)
        }
    }

    struct MockState {
        rng: ChaCha20Rng,
        elapsed: Duration,
    }

    /// Seeded RNG plus a clock that only moves when told to.
    ///
    /// Clones share the same clock and RNG stream.
    #[derive(Clone)]
    pub struct MockEnv {
        state: Arc<Mutex<MockState>>,
    }

    impl MockEnv {
        /// Environment with the given RNG seed, clock at zero.
        pub fn with_seed(seed: u64) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    rng: ChaCha20Rng::seed_from_u64(seed),
                    elapsed: Duration::ZERO,
                })),
            }
        }

        /// Move the virtual clock forward.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let mut state = self.state.lock().expect("MockEnv mutex poisoned");
            state.elapsed += by;
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::with_seed(0)
        }
    }

    impl Environment for MockEnv {
        type Instant = MockInstant;

        #[allow(clippy::expect_used)]
        fn now(&self) -> MockInstant {
            MockInstant(self.state.lock().expect("MockEnv mutex poisoned").elapsed)
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            self.advance(duration);
            std::future::ready(())
        }

        #[allow(clippy::expect_used)]
        fn random_bytes(&self, buffer: &mut [u8]) {
            self.state.lock().expect("MockEnv mutex poisoned").rng.fill_bytes(buffer);
        }
    }
}
