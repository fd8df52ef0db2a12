//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture the store and what clients received at one point in
//! time, so every invariant sees the same consistent picture.

use bytes::Bytes;
use threadsync_core::Thread;
use threadsync_server::{Storage, StorageError};

/// Snapshot of stored threads and observed feeds.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Every stored thread, sorted by id.
    pub threads: Vec<Thread>,
    /// Feeds recorded by clients.
    pub feeds: Vec<FeedSnapshot>,
}

impl SystemSnapshot {
    /// Empty snapshot (no threads, no feeds).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture every thread in `storage`.
    pub fn capture<S: Storage>(storage: &S) -> Result<Self, StorageError> {
        let mut ids = storage.thread_ids()?;
        ids.sort_unstable();

        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(thread) = storage.load_thread(id)? {
                threads.push(thread);
            }
        }
        Ok(Self { threads, feeds: Vec::new() })
    }

    /// Snapshot over the given threads.
    pub fn from_threads(threads: Vec<Thread>) -> Self {
        Self { threads, feeds: Vec::new() }
    }

    /// Add a recorded feed.
    #[must_use]
    pub fn with_feed(mut self, feed: FeedSnapshot) -> Self {
        self.feeds.push(feed);
        self
    }

    /// Thread by id.
    pub fn thread(&self, id: u64) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.id == id)
    }
}

/// Log entries one client received after synchronising to a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    /// Label for error reporting.
    pub client: u64,
    /// Followed thread.
    pub thread: u64,
    /// Counter the client synchronised from.
    pub from: u64,
    /// Entries received (backlog then live), in arrival order.
    pub received: Vec<Bytes>,
}

impl FeedSnapshot {
    /// Feed of `client` on `thread` starting at counter `from`.
    pub fn new(client: u64, thread: u64, from: u64) -> Self {
        Self { client, thread, from, received: Vec::new() }
    }

    /// Record received entries.
    #[must_use]
    pub fn with_received(mut self, entries: impl IntoIterator<Item = Bytes>) -> Self {
        self.received.extend(entries);
        self
    }
}
