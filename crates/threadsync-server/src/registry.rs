//! Sync registry: which connection follows which feed.
//!
//! The registry maintains bidirectional mappings: feed → connections (for
//! broadcast) and connection → feed (for cleanup on disconnect). A connection
//! follows at most one feed at a time, either a whole board (`op == 0`) or a
//! single thread.
//!
//! Connections must explicitly register before subscribing. Detaching a
//! connection removes its subscription and drops its live channel.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Feed a connection is synchronised to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncId {
    /// Board identifier
    pub board: String,
    /// Thread identifier, 0 for the board-wide feed
    pub op: u64,
}

impl SyncId {
    /// Board-wide feed.
    pub fn board(board: impl Into<String>) -> Self {
        Self { board: board.into(), op: 0 }
    }

    /// Single-thread feed.
    pub fn thread(board: impl Into<String>, op: u64) -> Self {
        Self { board: board.into(), op }
    }

    /// Whether this is a single-thread feed.
    pub fn is_thread(&self) -> bool {
        self.op != 0
    }
}

/// Committed log entry routed to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    /// Thread the entry belongs to
    pub thread: u64,
    /// Position of the entry in the thread's log
    pub index: u64,
    /// Encoded entry
    pub entry: Bytes,
}

#[derive(Debug)]
struct Connection {
    sync: Option<SyncId>,
    live: mpsc::UnboundedSender<LiveEntry>,
}

#[derive(Debug, Default)]
struct Directory {
    /// Connection ID → connection state
    connections: HashMap<u64, Connection>,
    /// Thread ID → connections following the thread
    threads: HashMap<u64, HashSet<u64>>,
    /// Board ID → connections following the board-wide feed
    boards: HashMap<String, HashSet<u64>>,
}

impl Directory {
    fn unlink(&mut self, conn: u64, sync: &SyncId) {
        if sync.is_thread() {
            if let Some(set) = self.threads.get_mut(&sync.op) {
                set.remove(&conn);
                if set.is_empty() {
                    self.threads.remove(&sync.op);
                }
            }
        } else if let Some(set) = self.boards.get_mut(&sync.board) {
            set.remove(&conn);
            if set.is_empty() {
                self.boards.remove(&sync.board);
            }
        }
    }

    fn link(&mut self, conn: u64, sync: &SyncId) {
        if sync.is_thread() {
            self.threads.entry(sync.op).or_default().insert(conn);
        } else {
            self.boards.entry(sync.board.clone()).or_default().insert(conn);
        }
    }

    /// Move `conn` to `sync`, returning its previous feed.
    ///
    /// `None` as the outer value means the connection is not registered.
    fn resubscribe(&mut self, conn: u64, sync: Option<SyncId>) -> Option<Option<SyncId>> {
        let previous = self.connections.get_mut(&conn)?.sync.take();
        if let Some(previous) = &previous {
            self.unlink(conn, previous);
        }
        if let Some(sync) = &sync {
            self.link(conn, sync);
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.sync = sync;
        }
        Some(previous)
    }
}

/// Shared registry of connections and their feeds.
///
/// Cloning yields another handle to the same registry. All operations take
/// one short internal lock, so a broadcast never interleaves with a
/// subscription change: a connection either is in the subscriber set when
/// an entry is routed or it is not.
#[derive(Debug, Clone)]
pub struct SyncRegistry {
    inner: Arc<Mutex<Directory>>,
    next_id: Arc<AtomicU64>,
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Directory::default())), next_id: Arc::new(AtomicU64::new(1)) }
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection, returning its identifier and the channel
    /// on which entries for its feed are delivered.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<LiveEntry>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (live, rx) = mpsc::unbounded_channel();

        let mut dir = self.lock();
        dir.connections.insert(id, Connection { sync: None, live });
        (id, rx)
    }

    /// Remove a connection and its subscription.
    ///
    /// Returns the feed it was following. Unknown connections are ignored.
    pub fn detach(&self, conn: u64) -> Option<SyncId> {
        let mut dir = self.lock();
        let connection = dir.connections.remove(&conn)?;
        if let Some(sync) = &connection.sync {
            dir.unlink(conn, sync);
        }
        connection.sync
    }

    /// Subscribe a connection to a feed, replacing its current one.
    ///
    /// Returns the previous feed. Unknown connections are ignored.
    pub fn subscribe(&self, conn: u64, sync: SyncId) -> Option<SyncId> {
        self.lock().resubscribe(conn, Some(sync)).flatten()
    }

    /// Put a connection back on a feed (or on none) after a failed
    /// subscription.
    pub fn restore(&self, conn: u64, sync: Option<SyncId>) {
        self.lock().resubscribe(conn, sync);
    }

    /// Feed a connection follows.
    pub fn sync_of(&self, conn: u64) -> Option<SyncId> {
        self.lock().connections.get(&conn).and_then(|c| c.sync.clone())
    }

    /// Connections following a thread.
    pub fn subscribers_of_thread(&self, thread: u64) -> Vec<u64> {
        self.lock().threads.get(&thread).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Number of connections following a thread.
    pub fn thread_subscriber_count(&self, thread: u64) -> usize {
        self.lock().threads.get(&thread).map_or(0, HashSet::len)
    }

    /// Number of connections following a board-wide feed.
    pub fn board_subscriber_count(&self, board: &str) -> usize {
        self.lock().boards.get(board).map_or(0, HashSet::len)
    }

    /// Total number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Route a committed entry to every connection following its thread.
    ///
    /// Returns the number of connections it was handed to. Connections whose
    /// receiver is gone are skipped; they are removed when they detach.
    pub fn broadcast(&self, thread: u64, index: u64, entry: &Bytes) -> usize {
        let dir = self.lock();
        let Some(subscribers) = dir.threads.get(&thread) else {
            return 0;
        };

        subscribers
            .iter()
            .filter_map(|conn| dir.connections.get(conn))
            .filter(|connection| {
                connection
                    .live
                    .send(LiveEntry { thread, index, entry: entry.clone() })
                    .is_ok()
            })
            .count()
    }
}
