//! Feed subscription and counter-based catch-up.
//!
//! A client names the last log counter it has seen; it receives the backlog
//! `log[ctr..]` once and then every entry appended afterwards. The handoff is
//! exactly-once because the connection joins the live fan-out *before* the
//! backlog is read and then filters live entries through a [`FeedCursor`]:
//! anything already covered by the backlog is dropped, anything past the
//! cursor is a gap that is filled from the store.

use bytes::Bytes;
use threadsync_core::Environment;
use threadsync_proto::SyncRequest;

use crate::{
    client::Client,
    context::ServerContext,
    error::{Rejection, RequestError},
    registry::{LiveEntry, SyncId},
    storage::Storage,
};

/// What to do with a live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Already delivered, or from a feed the client has left
    Stale,
    /// Next in order; send it
    Deliver,
    /// Entries `[from, entry.index)` are missing; load them first
    Gap {
        /// First missing index
        from: u64,
    },
}

/// Position of a connection in one thread's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedCursor {
    /// Followed thread
    pub thread: u64,
    /// Next expected log index
    pub next: u64,
}

impl FeedCursor {
    /// Cursor expecting `next` as the next index of `thread`.
    pub fn new(thread: u64, next: u64) -> Self {
        Self { thread, next }
    }

    /// Classify a live entry against the cursor.
    pub fn accept(&self, entry: &LiveEntry) -> Delivery {
        if entry.thread != self.thread || entry.index < self.next {
            Delivery::Stale
        } else if entry.index == self.next {
            Delivery::Deliver
        } else {
            Delivery::Gap { from: self.next }
        }
    }

    /// Record `count` more entries as delivered.
    pub fn advance(&mut self, count: u64) {
        self.next += count;
    }
}

/// Attach `client` to a board or thread feed.
///
/// Returns the catch-up backlog, `log[ctr..]`, in order; empty for a
/// board-wide feed. Every rejection happens before the client or the
/// registry is touched.
pub fn synchronise<S: Storage, E: Environment>(
    ctx: &ServerContext<S, E>,
    client: &mut Client,
    req: &SyncRequest,
) -> Result<Vec<Bytes>, RequestError> {
    if !ctx.boards.is_known(&req.board) {
        return Err(Rejection::InvalidBoard(req.board.clone()).into());
    }

    if req.thread == 0 {
        ctx.registry.subscribe(client.id, SyncId::board(req.board.clone()));
        client.sync = Some(SyncId::board(req.board.clone()));
        client.cursor = None;
        tracing::debug!(connection = client.id, board = %req.board, "synced to board");
        return Ok(Vec::new());
    }

    let meta = ctx
        .storage
        .thread_meta(req.thread)?
        .filter(|meta| meta.board == req.board)
        .ok_or(Rejection::InvalidThread(req.thread))?;

    let ctr = u64::try_from(req.ctr)
        .ok()
        .filter(|&ctr| ctr <= meta.log_len)
        .ok_or(Rejection::InvalidCounter { ctr: req.ctr, log_len: meta.log_len })?;

    let sync = SyncId::thread(req.board.clone(), req.thread);
    let previous = ctx.registry.subscribe(client.id, sync.clone());

    let backlog = match ctx.storage.load_log(req.thread, ctr) {
        Ok(backlog) => backlog,
        Err(e) => {
            ctx.registry.restore(client.id, previous);
            return Err(e.into());
        },
    };

    client.sync = Some(sync);
    client.cursor = Some(FeedCursor::new(req.thread, ctr + backlog.len() as u64));

    tracing::debug!(
        connection = client.id,
        thread = req.thread,
        ctr,
        backlog = backlog.len(),
        "synced to thread"
    );
    Ok(backlog)
}
