#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use threadsync_core::{Account, Board, ImageToken, Session, Thread};
use tokio::sync::mpsc;

use super::{LogAppended, Outcome, Storage, StorageError, ThreadMeta, ThreadUpdate};

/// In-memory document store.
///
/// One mutex guards every collection, so each trait method is trivially
/// atomic. Append notifications are published while the lock is held, which
/// makes their order match commit order. A poisoned lock is recovered rather
/// than propagated: every mutation validates before writing, so a panicking
/// holder cannot leave a half-applied document behind.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Last reserved post identifier
    last_post_id: u64,

    /// Thread documents by id
    threads: HashMap<u64, Thread>,

    /// Board documents by id
    boards: HashMap<String, Board>,

    /// Display counters by board id
    board_counters: HashMap<String, u64>,

    /// Account documents by id
    accounts: HashMap<String, Account>,

    /// Image reservations by token
    image_tokens: HashMap<String, ImageToken>,

    /// Live append subscribers; closed ones are pruned on publish
    watchers: Vec<mpsc::UnboundedSender<LogAppended>>,
}

impl MemoryStorageInner {
    fn publish(&mut self, thread: u64, first_index: u64, entries: &[Bytes]) {
        if entries.is_empty() {
            return;
        }

        self.watchers.retain(|watcher| {
            entries.iter().zip(first_index..).all(|(entry, index)| {
                watcher.send(LogAppended { thread, index, entry: entry.clone() }).is_ok()
            })
        });
    }
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored threads.
    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    /// Total number of log entries across all threads.
    pub fn total_entry_count(&self) -> usize {
        self.lock().threads.values().map(|thread| thread.log.len()).sum()
    }

    /// Number of outstanding image tokens.
    pub fn image_token_count(&self) -> usize {
        self.lock().image_tokens.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn reserve_post_id(&self) -> Result<u64, StorageError> {
        let mut inner = self.lock();
        inner.last_post_id += 1;
        Ok(inner.last_post_id)
    }

    fn insert_thread(&self, thread: &Thread) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.threads.contains_key(&thread.id) {
            return Err(StorageError::Conflict { kind: "thread", key: thread.id.to_string() });
        }

        // Seeded ids must not be handed out again.
        let max_post = thread.posts.keys().copied().max().unwrap_or(thread.id);
        inner.last_post_id = inner.last_post_id.max(max_post).max(thread.id);
        inner.threads.insert(thread.id, thread.clone());
        Ok(())
    }

    fn thread_meta(&self, id: u64) -> Result<Option<ThreadMeta>, StorageError> {
        Ok(self.lock().threads.get(&id).map(ThreadMeta::from))
    }

    fn load_thread(&self, id: u64) -> Result<Option<Thread>, StorageError> {
        Ok(self.lock().threads.get(&id).cloned())
    }

    fn load_log(&self, id: u64, from: u64) -> Result<Vec<Bytes>, StorageError> {
        let inner = self.lock();
        let thread = inner.threads.get(&id).ok_or_else(|| StorageError::thread_not_found(id))?;

        let start = (from as usize).min(thread.log.len());
        Ok(thread.log[start..].to_vec())
    }

    fn update_thread<R, F>(&self, id: u64, plan: F) -> Result<Outcome<R>, StorageError>
    where
        F: FnOnce(&Thread) -> Result<ThreadUpdate, R>,
    {
        let mut inner = self.lock();
        let thread =
            inner.threads.get_mut(&id).ok_or_else(|| StorageError::thread_not_found(id))?;

        let update = match plan(thread) {
            Ok(update) => update,
            Err(reason) => return Ok(Outcome::Declined(reason)),
        };
        let appended = update.apply_to(thread)?;

        // Entries are shared buffers; copying the handles ends the borrow of
        // the thread before publishing needs the whole inner state.
        let entries: Vec<Bytes> = thread.log[appended.first_index as usize..].to_vec();
        inner.publish(id, appended.first_index, &entries);
        Ok(Outcome::Applied(appended))
    }

    fn thread_ids(&self) -> Result<Vec<u64>, StorageError> {
        Ok(self.lock().threads.keys().copied().collect())
    }

    fn set_locked(&self, id: u64, locked: bool) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let thread =
            inner.threads.get_mut(&id).ok_or_else(|| StorageError::thread_not_found(id))?;
        thread.locked = locked;
        Ok(())
    }

    fn create_board(&self, board: &Board) -> Result<(), StorageError> {
        self.lock().boards.entry(board.id.clone()).or_insert_with(|| board.clone());
        Ok(())
    }

    fn list_boards(&self) -> Result<Vec<Board>, StorageError> {
        Ok(self.lock().boards.values().cloned().collect())
    }

    fn increment_board_counter(&self, board: &str) -> Result<u64, StorageError> {
        let mut inner = self.lock();
        let counter = inner.board_counters.entry(board.to_owned()).or_default();
        *counter += 1;
        Ok(*counter)
    }

    fn board_counter(&self, board: &str) -> Result<u64, StorageError> {
        Ok(self.lock().board_counters.get(board).copied().unwrap_or(0))
    }

    fn latest_post_time(&self, board: &str) -> Result<Option<u64>, StorageError> {
        let inner = self.lock();
        Ok(inner
            .threads
            .values()
            .filter(|thread| thread.board == board)
            .map(Thread::latest_post_time)
            .max())
    }

    fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        self.lock().accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn load_account(&self, id: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.lock().accounts.get(id).cloned())
    }

    fn retain_sessions<F>(&self, keep: F) -> Result<usize, StorageError>
    where
        F: Fn(&Session) -> bool,
    {
        let mut inner = self.lock();
        let mut removed = 0;
        for account in inner.accounts.values_mut() {
            let before = account.sessions.len();
            account.sessions.retain(&keep);
            removed += before - account.sessions.len();
        }
        Ok(removed)
    }

    fn insert_image_token(&self, token: &ImageToken) -> Result<(), StorageError> {
        self.lock().image_tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    fn take_image_token(&self, token: &str) -> Result<Option<ImageToken>, StorageError> {
        Ok(self.lock().image_tokens.remove(token))
    }

    fn take_expired_image_tokens(&self, now: u64) -> Result<Vec<ImageToken>, StorageError> {
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .image_tokens
            .values()
            .filter(|token| token.is_expired(now))
            .map(|token| token.token.clone())
            .collect();

        Ok(expired.iter().filter_map(|key| inner.image_tokens.remove(key)).collect())
    }

    fn watch_appends(&self) -> mpsc::UnboundedReceiver<LogAppended> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use threadsync_core::Post;

    use super::*;
    use crate::storage::{Appended, PostPatch};

    fn post(id: u64, op: u64, time: u64) -> Post {
        Post {
            id,
            op,
            editing: true,
            time,
            body: String::new(),
            name: String::new(),
            trip: String::new(),
            email: String::new(),
            image: None,
            ip: None,
            password: Vec::new(),
        }
    }

    fn thread_with_log(id: u64, board: &str, entries: &[&'static [u8]]) -> Thread {
        let mut thread = Thread::new(board, "subject", post(id, id, 100));
        thread.log = entries.iter().copied().map(Bytes::from_static).collect();
        thread
    }

    #[test]
    fn new_storage_is_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.thread_count(), 0);
        assert_eq!(storage.total_entry_count(), 0);
        assert_eq!(storage.thread_ids().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn post_ids_are_strictly_increasing() {
        let storage = MemoryStorage::new();
        let a = storage.reserve_post_id().unwrap();
        let b = storage.reserve_post_id().unwrap();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn seeded_thread_ids_are_not_reused() {
        let storage = MemoryStorage::new();
        storage.insert_thread(&thread_with_log(40, "a", &[])).unwrap();
        assert_eq!(storage.reserve_post_id().unwrap(), 41);
    }

    #[test]
    fn insert_thread_conflicts_on_existing_id() {
        let storage = MemoryStorage::new();
        storage.insert_thread(&thread_with_log(1, "a", &[])).unwrap();
        let err = storage.insert_thread(&thread_with_log(1, "b", &[])).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { kind: "thread", .. }));
    }

    #[test]
    fn load_log_returns_suffix() {
        let storage = MemoryStorage::new();
        storage.insert_thread(&thread_with_log(1, "a", &[b"x", b"y", b"z"])).unwrap();

        assert_eq!(storage.load_log(1, 0).unwrap().len(), 3);
        assert_eq!(storage.load_log(1, 2).unwrap(), vec![Bytes::from_static(b"z")]);
        assert!(storage.load_log(1, 3).unwrap().is_empty());
        assert!(storage.load_log(1, 99).unwrap().is_empty());
        assert!(storage.load_log(2, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn declined_update_writes_nothing() {
        let storage = MemoryStorage::new();
        storage.insert_thread(&thread_with_log(1, "a", &[b"x"])).unwrap();
        let mut feed = storage.watch_appends();

        let outcome = storage
            .update_thread(1, |_| -> Result<ThreadUpdate, &str> { Err("locked") })
            .unwrap();
        assert_eq!(outcome, Outcome::Declined("locked"));
        assert_eq!(storage.thread_meta(1).unwrap().unwrap().log_len, 1);
        assert!(feed.try_recv().is_err());
    }

    #[test]
    fn applied_update_publishes_in_order() {
        let storage = MemoryStorage::new();
        storage.insert_thread(&thread_with_log(1, "a", &[b"x"])).unwrap();
        let mut feed = storage.watch_appends();

        let outcome = storage
            .update_thread(1, |thread| -> Result<_, ()> {
                assert_eq!(thread.log_len(), 1);
                Ok(ThreadUpdate::new()
                    .append(Bytes::from_static(b"y"))
                    .append(Bytes::from_static(b"z"))
                    .patch_post(1, PostPatch::Close))
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Applied(Appended { first_index: 1, count: 2 }));

        let first = feed.try_recv().unwrap();
        let second = feed.try_recv().unwrap();
        assert_eq!((first.thread, first.index, &first.entry[..]), (1, 1, &b"y"[..]));
        assert_eq!((second.thread, second.index, &second.entry[..]), (1, 2, &b"z"[..]));
        assert!(!storage.load_thread(1).unwrap().unwrap().posts[&1].editing);
    }

    #[test]
    fn dropped_watchers_are_pruned() {
        let storage = MemoryStorage::new();
        storage.insert_thread(&thread_with_log(1, "a", &[])).unwrap();
        drop(storage.watch_appends());
        let mut live = storage.watch_appends();

        storage
            .update_thread(1, |_| -> Result<_, ()> {
                Ok(ThreadUpdate::new().append(Bytes::from_static(b"y")))
            })
            .unwrap();

        assert_eq!(live.try_recv().unwrap().index, 0);
        assert_eq!(storage.lock().watchers.len(), 1);
    }

    #[test]
    fn update_unknown_thread_is_not_found() {
        let storage = MemoryStorage::new();
        let result = storage.update_thread(5, |_| -> Result<_, ()> { Ok(ThreadUpdate::new()) });
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn board_counters_start_at_zero() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.board_counter("a").unwrap(), 0);
        assert_eq!(storage.increment_board_counter("a").unwrap(), 1);
        assert_eq!(storage.increment_board_counter("a").unwrap(), 2);
        assert_eq!(storage.board_counter("b").unwrap(), 0);
    }

    #[test]
    fn create_board_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.create_board(&Board { id: "a".into(), created: 1 }).unwrap();
        storage.create_board(&Board { id: "a".into(), created: 99 }).unwrap();

        assert_eq!(storage.list_boards().unwrap(), vec![Board { id: "a".into(), created: 1 }]);
    }

    #[test]
    fn latest_post_time_spans_threads() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.latest_post_time("a").unwrap(), None);

        let mut thread = thread_with_log(1, "a", &[]);
        thread.posts.insert(5, post(5, 1, 300));
        storage.insert_thread(&thread).unwrap();
        storage.insert_thread(&thread_with_log(2, "a", &[])).unwrap();
        storage.insert_thread(&thread_with_log(3, "b", &[])).unwrap();

        assert_eq!(storage.latest_post_time("a").unwrap(), Some(300));
        assert_eq!(storage.latest_post_time("b").unwrap(), Some(100));
    }

    #[test]
    fn retain_sessions_leaves_empty_sets() {
        let storage = MemoryStorage::new();
        storage
            .insert_account(&Account {
                id: "a".into(),
                sessions: vec![Session { token: "t".into(), expires: 1 }],
            })
            .unwrap();

        assert_eq!(storage.retain_sessions(|s| s.expires > 5).unwrap(), 1);
        assert!(storage.load_account("a").unwrap().unwrap().sessions.is_empty());
    }

    #[test]
    fn image_tokens_are_taken_once() {
        let storage = MemoryStorage::new();
        let token = ImageToken { token: "t".into(), expires: 10, sha1: "s".into() };
        storage.insert_image_token(&token).unwrap();

        assert_eq!(storage.take_image_token("t").unwrap(), Some(token));
        assert_eq!(storage.take_image_token("t").unwrap(), None);
    }

    #[test]
    fn take_expired_tokens_leaves_fresh_ones() {
        let storage = MemoryStorage::new();
        storage
            .insert_image_token(&ImageToken { token: "old".into(), expires: 5, sha1: "a".into() })
            .unwrap();
        storage
            .insert_image_token(&ImageToken { token: "new".into(), expires: 50, sha1: "b".into() })
            .unwrap();

        let expired = storage.take_expired_image_tokens(10).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, "old");
        assert_eq!(storage.image_token_count(), 1);
    }
}
