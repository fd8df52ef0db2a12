//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test error handling and
//! partial-failure paths (request handlers, upkeep passes, catch-up).

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use threadsync_core::{Account, Board, ImageToken, Session, Thread};
use tokio::sync::mpsc;

use super::{LogAppended, Outcome, Storage, StorageError, ThreadMeta, ThreadUpdate};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with a configured probability before they reach it, so an injected
/// failure never leaves a partial write behind. Append notifications are
/// never dropped: they come from the inner store.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator, so chaos tests are reproducible with the
/// same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper with a fixed seed.
    ///
    /// The rate is clamped to [0.0, 1.0].
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        debug_assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn roll(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn reserve_post_id(&self) -> Result<u64, StorageError> {
        self.roll()?;
        self.inner.reserve_post_id()
    }

    fn insert_thread(&self, thread: &Thread) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.insert_thread(thread)
    }

    fn thread_meta(&self, id: u64) -> Result<Option<ThreadMeta>, StorageError> {
        self.roll()?;
        self.inner.thread_meta(id)
    }

    fn load_thread(&self, id: u64) -> Result<Option<Thread>, StorageError> {
        self.roll()?;
        self.inner.load_thread(id)
    }

    fn load_log(&self, id: u64, from: u64) -> Result<Vec<Bytes>, StorageError> {
        self.roll()?;
        self.inner.load_log(id, from)
    }

    fn update_thread<R, F>(&self, id: u64, plan: F) -> Result<Outcome<R>, StorageError>
    where
        F: FnOnce(&Thread) -> Result<ThreadUpdate, R>,
    {
        self.roll()?;
        self.inner.update_thread(id, plan)
    }

    fn thread_ids(&self) -> Result<Vec<u64>, StorageError> {
        self.roll()?;
        self.inner.thread_ids()
    }

    fn set_locked(&self, id: u64, locked: bool) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.set_locked(id, locked)
    }

    fn create_board(&self, board: &Board) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.create_board(board)
    }

    fn list_boards(&self) -> Result<Vec<Board>, StorageError> {
        self.roll()?;
        self.inner.list_boards()
    }

    fn increment_board_counter(&self, board: &str) -> Result<u64, StorageError> {
        self.roll()?;
        self.inner.increment_board_counter(board)
    }

    fn board_counter(&self, board: &str) -> Result<u64, StorageError> {
        self.roll()?;
        self.inner.board_counter(board)
    }

    fn latest_post_time(&self, board: &str) -> Result<Option<u64>, StorageError> {
        self.roll()?;
        self.inner.latest_post_time(board)
    }

    fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.insert_account(account)
    }

    fn load_account(&self, id: &str) -> Result<Option<Account>, StorageError> {
        self.roll()?;
        self.inner.load_account(id)
    }

    fn retain_sessions<F>(&self, keep: F) -> Result<usize, StorageError>
    where
        F: Fn(&Session) -> bool,
    {
        self.roll()?;
        self.inner.retain_sessions(keep)
    }

    fn insert_image_token(&self, token: &ImageToken) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.insert_image_token(token)
    }

    fn take_image_token(&self, token: &str) -> Result<Option<ImageToken>, StorageError> {
        self.roll()?;
        self.inner.take_image_token(token)
    }

    fn take_expired_image_tokens(&self, now: u64) -> Result<Vec<ImageToken>, StorageError> {
        self.roll()?;
        self.inner.take_expired_image_tokens(now)
    }

    fn watch_appends(&self) -> mpsc::UnboundedReceiver<LogAppended> {
        self.inner.watch_appends()
    }
}
