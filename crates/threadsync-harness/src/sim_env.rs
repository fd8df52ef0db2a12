//! Deterministic environment for simulation tests.
//!
//! Time only moves when a test advances it, and randomness comes from a
//! seeded ChaCha RNG, so a run is reproducible from its seed.

#![allow(clippy::disallowed_types, reason = "Locking simple clock and RNG state")]

use std::{
    ops::Sub,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use threadsync_core::Environment;

/// Wall clock at a fresh `SimEnv`: 2024-01-01T00:00:00Z.
pub const SIM_EPOCH: u64 = 1_704_067_200;

/// Virtual monotonic instant, measured from the start of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

struct SimState {
    elapsed: Duration,
    wall_clock: u64,
    rng: ChaCha8Rng,
}

/// Manually advanced clock and seeded RNG.
///
/// Clones share the same clock and RNG.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl SimEnv {
    /// Fresh environment at [`SIM_EPOCH`].
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                elapsed: Duration::ZERO,
                wall_clock: SIM_EPOCH,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move both clocks forward. The wall clock moves in whole seconds.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.elapsed += by;
        state.wall_clock += by.as_secs();
    }

    /// Set the wall clock. It may go backwards; the monotonic clock does not
    /// move.
    pub fn set_wall_clock(&self, secs: u64) {
        self.lock().wall_clock = secs;
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.lock().elapsed)
    }

    fn wall_clock_secs(&self) -> u64 {
        self.lock().wall_clock
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            env.advance(duration);
            tokio::task::yield_now().await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }
}
