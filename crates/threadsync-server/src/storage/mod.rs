//! Log store abstraction.
//!
//! Trait-based abstraction over the document store holding threads, boards,
//! accounts and image tokens. The trait is synchronous (no async) and every
//! method is a single atomic operation on one document or collection.
//!
//! Thread documents are only ever mutated through [`Storage::update_thread`],
//! whose plan can append to the log but never truncate or reorder it. Every
//! appended entry is published on [`Storage::watch_appends`] in commit order,
//! which is what keeps live subscribers in sync regardless of which component
//! wrote the entry.

mod chaotic;
mod error;
mod memory;

use bytes::Bytes;
pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use threadsync_core::{Account, Board, ImageToken, Post, Session, Thread};
use tokio::sync::mpsc;

/// Thread fields needed to validate a request without loading the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMeta {
    /// Thread identifier
    pub id: u64,
    /// Owning board
    pub board: String,
    /// Replies refused while set
    pub locked: bool,
    /// Number of replies
    pub post_ctr: u64,
    /// Number of posts with images
    pub image_ctr: u64,
    /// Number of log entries
    pub log_len: u64,
}

impl From<&Thread> for ThreadMeta {
    fn from(thread: &Thread) -> Self {
        Self {
            id: thread.id,
            board: thread.board.clone(),
            locked: thread.locked,
            post_ctr: thread.post_ctr,
            image_ctr: thread.image_ctr,
            log_len: thread.log_len(),
        }
    }
}

/// In-place change to an existing post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostPatch {
    /// Clear the editing flag
    Close,
    /// Replace the body
    SetBody(String),
}

/// Atomic change set for one thread document.
///
/// Only additive or in-place changes can be expressed: the log can be
/// appended to but not truncated or reordered, posts can be inserted or
/// patched but not removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadUpdate {
    entries: Vec<Bytes>,
    posts: Vec<Post>,
    patches: Vec<(u64, PostPatch)>,
    post_ctr_delta: u64,
    image_ctr_delta: u64,
    reply_time: Option<u64>,
    bump_time: Option<u64>,
}

/// Log range written by an applied [`ThreadUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Index of the first appended entry (the log length before the update)
    pub first_index: u64,
    /// Number of appended entries
    pub count: u64,
}

/// Result of a conditional thread update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<R> {
    /// The plan produced an update and it was applied
    Applied(Appended),
    /// The plan declined; nothing was written
    Declined(R),
}

/// Notification for one committed log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppended {
    /// Thread the entry was appended to
    pub thread: u64,
    /// Position of the entry in the thread's log
    pub index: u64,
    /// Encoded entry
    pub entry: Bytes,
}

impl ThreadUpdate {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an encoded entry to the log.
    #[must_use]
    pub fn append(mut self, entry: Bytes) -> Self {
        self.entries.push(entry);
        self
    }

    /// Insert a new post into the post map.
    #[must_use]
    pub fn insert_post(mut self, post: Post) -> Self {
        self.posts.push(post);
        self
    }

    /// Patch an existing post.
    #[must_use]
    pub fn patch_post(mut self, id: u64, patch: PostPatch) -> Self {
        self.patches.push((id, patch));
        self
    }

    /// Count one more reply.
    #[must_use]
    pub fn increment_post_ctr(mut self) -> Self {
        self.post_ctr_delta += 1;
        self
    }

    /// Count one more image.
    #[must_use]
    pub fn increment_image_ctr(mut self) -> Self {
        self.image_ctr_delta += 1;
        self
    }

    /// Set the latest reply time.
    #[must_use]
    pub fn reply_time(mut self, time: u64) -> Self {
        self.reply_time = Some(time);
        self
    }

    /// Set the bump time.
    #[must_use]
    pub fn bump(mut self, time: u64) -> Self {
        self.bump_time = Some(time);
        self
    }

    /// Whether applying the update would change nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply to `thread`, all or nothing.
    ///
    /// Fails with `Conflict` if an inserted post already exists and with
    /// `NotFound` if a patch names an unknown post; `thread` is untouched in
    /// both cases. Store implementations call this under their document lock.
    pub fn apply_to(self, thread: &mut Thread) -> Result<Appended, StorageError> {
        for post in &self.posts {
            if thread.posts.contains_key(&post.id) {
                return Err(StorageError::Conflict { kind: "post", key: post.id.to_string() });
            }
        }
        for (id, _) in &self.patches {
            let inserted = self.posts.iter().any(|post| post.id == *id);
            if !inserted && !thread.posts.contains_key(id) {
                return Err(StorageError::post_not_found(*id));
            }
        }

        let first_index = thread.log_len();
        let count = self.entries.len() as u64;

        for post in self.posts {
            thread.posts.insert(post.id, post);
        }
        for (id, patch) in self.patches {
            if let Some(post) = thread.posts.get_mut(&id) {
                match patch {
                    PostPatch::Close => post.editing = false,
                    PostPatch::SetBody(body) => post.body = body,
                }
            }
        }
        thread.log.extend(self.entries);
        thread.post_ctr += self.post_ctr_delta;
        thread.image_ctr += self.image_ctr_delta;
        if let Some(time) = self.reply_time {
            thread.reply_time = time;
        }
        if let Some(time) = self.bump_time {
            thread.bump_time = time;
        }

        debug_assert_eq!(thread.log_len(), first_index + count);
        Ok(Appended { first_index, count })
    }
}

/// Document store for threads, boards, accounts and image tokens.
///
/// Must be Clone (shared by every connection task and the scheduler), Send +
/// Sync, and synchronous. Implementations share internal state via Arc, so
/// clones access the same underlying documents.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Reserve a new post identifier.
    ///
    /// # Invariants
    ///
    /// - Identifiers are unique and strictly increasing across all threads.
    /// - Identifiers are never 0, which means "no thread" on the wire.
    fn reserve_post_id(&self) -> Result<u64, StorageError>;

    /// Insert a new thread document. `Conflict` if the id is taken.
    fn insert_thread(&self, thread: &Thread) -> Result<(), StorageError>;

    /// Thread metadata. `None` if the thread doesn't exist.
    fn thread_meta(&self, id: u64) -> Result<Option<ThreadMeta>, StorageError>;

    /// Full thread document. `None` if the thread doesn't exist.
    fn load_thread(&self, id: u64) -> Result<Option<Thread>, StorageError>;

    /// Log entries `[from, len)`. Empty if `from >= len`.
    ///
    /// `NotFound` if the thread doesn't exist.
    fn load_log(&self, id: u64, from: u64) -> Result<Vec<Bytes>, StorageError>;

    /// Atomic conditional read-modify-write of one thread.
    ///
    /// `plan` sees the current document and either returns the update to
    /// apply or declines with a reason. It runs while the document is held,
    /// so it must not call back into the store. An error means nothing was
    /// written.
    ///
    /// `NotFound` if the thread doesn't exist.
    fn update_thread<R, F>(&self, id: u64, plan: F) -> Result<Outcome<R>, StorageError>
    where
        F: FnOnce(&Thread) -> Result<ThreadUpdate, R>;

    /// All thread identifiers. Order is not guaranteed.
    fn thread_ids(&self) -> Result<Vec<u64>, StorageError>;

    /// Set or clear a thread's lock flag.
    fn set_locked(&self, id: u64, locked: bool) -> Result<(), StorageError>;

    /// Create a board. Idempotent: an existing board is left unchanged.
    fn create_board(&self, board: &Board) -> Result<(), StorageError>;

    /// All boards. Order is not guaranteed.
    fn list_boards(&self) -> Result<Vec<Board>, StorageError>;

    /// Increment a board's display counter, returning the new value.
    fn increment_board_counter(&self, board: &str) -> Result<u64, StorageError>;

    /// Current display counter of a board (0 if never incremented).
    fn board_counter(&self, board: &str) -> Result<u64, StorageError>;

    /// Creation time of the newest post on a board. `None` if the board has
    /// no threads.
    fn latest_post_time(&self, board: &str) -> Result<Option<u64>, StorageError>;

    /// Insert or replace an account.
    fn insert_account(&self, account: &Account) -> Result<(), StorageError>;

    /// Load an account. `None` if it doesn't exist.
    fn load_account(&self, id: &str) -> Result<Option<Account>, StorageError>;

    /// Keep only sessions for which `keep` returns true, across all accounts.
    /// Returns the number of sessions removed. Session sets may become empty
    /// but are never removed.
    fn retain_sessions<F>(&self, keep: F) -> Result<usize, StorageError>
    where
        F: Fn(&Session) -> bool;

    /// Insert an image token, replacing one with the same key.
    fn insert_image_token(&self, token: &ImageToken) -> Result<(), StorageError>;

    /// Atomically remove and return an image token.
    fn take_image_token(&self, token: &str) -> Result<Option<ImageToken>, StorageError>;

    /// Atomically remove and return every token expired at `now`.
    fn take_expired_image_tokens(&self, now: u64) -> Result<Vec<ImageToken>, StorageError>;

    /// Subscribe to committed log entries.
    ///
    /// # Invariants
    ///
    /// - Every entry appended after this call is published exactly once, in
    ///   commit order per thread, whichever writer appended it.
    fn watch_appends(&self) -> mpsc::UnboundedReceiver<LogAppended>;
}
