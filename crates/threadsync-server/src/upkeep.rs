//! Periodic maintenance of time-based invariants.
//!
//! Four independent passes, each idempotent and safe to run beside live
//! traffic:
//!
//! - close posts left open past the staleness threshold
//! - reclaim expired image tokens and release their images
//! - drop expired login sessions
//! - list boards that look abandoned (audit only, nothing is deleted)
//!
//! Every thread mutation goes through the same atomic
//! [`Storage::update_thread`] as the request handlers, so a pass and a
//! concurrent request on the same thread are serialised by the store. Each
//! pass runs on its own timer in its own task; a failing pass is logged and
//! retried on its next tick without affecting the others.

use std::{sync::Arc, time::Duration};

use threadsync_core::Environment;
use threadsync_proto::{MessageType, ProtocolError, encode_message};
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    collaborators::{ImageError, ImageStore},
    config::UpkeepConfig,
    error::UpkeepError,
    storage::{Outcome, PostPatch, Storage, ThreadUpdate},
};

/// One maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Close stale open posts
    CloseDanglingPosts,
    /// Reclaim expired image tokens
    ExpireImageTokens,
    /// Drop expired sessions
    ExpireSessions,
    /// List inactive boards
    AuditBoards,
}

impl Pass {
    /// Every pass, in scheduling order.
    pub const ALL: [Self; 4] =
        [Self::CloseDanglingPosts, Self::ExpireImageTokens, Self::ExpireSessions, Self::AuditBoards];

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::CloseDanglingPosts => "open post cleanup",
            Self::ExpireImageTokens => "image token expiry",
            Self::ExpireSessions => "session cleanup",
            Self::AuditBoards => "board audit",
        }
    }

    fn interval(self, config: &UpkeepConfig) -> Duration {
        match self {
            Self::CloseDanglingPosts => config.close_posts_every,
            Self::ExpireImageTokens => config.expire_tokens_every,
            Self::ExpireSessions => config.expire_sessions_every,
            Self::AuditBoards => config.audit_boards_every,
        }
    }
}

/// Result of closing stale posts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosedPosts {
    /// Threads that had at least one post closed
    pub threads: usize,
    /// Posts closed
    pub posts: u64,
    /// Threads that could not be processed
    pub failed_threads: Vec<u64>,
}

/// Result of reclaiming expired image tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenExpiry {
    /// Tokens removed
    pub expired: usize,
    /// Images that could not be released, with the cause
    pub failures: Vec<(String, ImageError)>,
}

/// Result of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassReport {
    /// See [`Upkeep::close_dangling_posts`]
    ClosedPosts(ClosedPosts),
    /// See [`Upkeep::expire_image_tokens`]
    TokenExpiry(TokenExpiry),
    /// Number of sessions removed
    Sessions(usize),
    /// Identifiers of inactive boards
    UnusedBoards(Vec<String>),
}

/// The upkeep scheduler.
#[derive(Clone)]
pub struct Upkeep<S: Storage, E: Environment> {
    storage: S,
    env: E,
    images: Arc<dyn ImageStore>,
    config: UpkeepConfig,
}

impl<S: Storage, E: Environment> Upkeep<S, E> {
    /// Scheduler over `storage`, releasing images through `images`.
    pub fn new(storage: S, env: E, images: Arc<dyn ImageStore>, config: UpkeepConfig) -> Self {
        Self { storage, env, images, config }
    }

    /// Close every open post created before the staleness threshold.
    ///
    /// Each affected thread gets one `ClosePost` entry per closed post and
    /// the posts' editing flags cleared, in one atomic update. Threads
    /// without stale posts are not written. A thread that fails is recorded
    /// and skipped.
    pub fn close_dangling_posts(&self) -> Result<ClosedPosts, UpkeepError> {
        let now = self.env.wall_clock_secs();
        let cutoff = now.saturating_sub(self.config.post_stale_after.as_secs());
        let mut report = ClosedPosts::default();

        for id in self.storage.thread_ids()? {
            let outcome = self.storage.update_thread(id, |thread| {
                let stale = thread.stale_posts(cutoff);
                if stale.is_empty() {
                    return Err(None::<ProtocolError>);
                }

                stale.into_iter().try_fold(ThreadUpdate::new(), |update, post| {
                    let entry = encode_message(MessageType::ClosePost, &post).map_err(Some)?;
                    Ok(update.patch_post(post, PostPatch::Close).append(entry))
                })
            });

            match outcome {
                Ok(Outcome::Applied(appended)) => {
                    tracing::debug!(thread = id, closed = appended.count, "closed stale posts");
                    report.threads += 1;
                    report.posts += appended.count;
                },
                Ok(Outcome::Declined(None)) => {},
                Ok(Outcome::Declined(Some(e))) => {
                    tracing::error!(thread = id, error = %e, "failed to encode close entry");
                    report.failed_threads.push(id);
                },
                // Removed since the id list was read.
                Err(e) if e.is_not_found() => {},
                Err(e) => {
                    tracing::warn!(thread = id, error = %e, "failed to close stale posts");
                    report.failed_threads.push(id);
                },
            }
        }

        Ok(report)
    }

    /// Remove every expired image token and release its image.
    ///
    /// Every token is processed even if releasing one image fails; failures
    /// are returned in the report.
    pub fn expire_image_tokens(&self) -> Result<TokenExpiry, UpkeepError> {
        let now = self.env.wall_clock_secs();
        let expired = self.storage.take_expired_image_tokens(now)?;
        let mut report = TokenExpiry { expired: expired.len(), failures: Vec::new() };

        for token in expired {
            if let Err(e) = self.images.deallocate(&token.sha1) {
                tracing::error!(sha1 = %token.sha1, error = %e, "failed to release image");
                report.failures.push((token.sha1, e));
            }
        }

        Ok(report)
    }

    /// Drop expired sessions from every account, returning how many were
    /// removed.
    pub fn expire_sessions(&self) -> Result<usize, UpkeepError> {
        let now = self.env.wall_clock_secs();
        Ok(self.storage.retain_sessions(|session| !session.is_expired(now))?)
    }

    /// Boards older than the minimum age whose newest post is older than the
    /// inactivity threshold, sorted by id.
    ///
    /// Boards without any thread are never listed. Nothing is deleted.
    pub fn unused_boards(&self) -> Result<Vec<String>, UpkeepError> {
        let now = self.env.wall_clock_secs();
        let created_before = now.saturating_sub(self.config.board_min_age.as_secs());
        let active_since = now.saturating_sub(self.config.board_inactive_after.as_secs());

        let mut candidates = Vec::new();
        for board in self.storage.list_boards()? {
            if board.created >= created_before {
                continue;
            }
            if let Some(latest) = self.storage.latest_post_time(&board.id)? {
                if latest < active_since {
                    candidates.push(board.id);
                }
            }
        }

        candidates.sort_unstable();
        Ok(candidates)
    }

    /// Run a single pass now.
    pub fn run_once(&self, pass: Pass) -> Result<PassReport, UpkeepError> {
        Ok(match pass {
            Pass::CloseDanglingPosts => PassReport::ClosedPosts(self.close_dangling_posts()?),
            Pass::ExpireImageTokens => PassReport::TokenExpiry(self.expire_image_tokens()?),
            Pass::ExpireSessions => PassReport::Sessions(self.expire_sessions()?),
            Pass::AuditBoards => PassReport::UnusedBoards(self.unused_boards()?),
        })
    }

    fn tick(&self, pass: Pass) {
        let name = pass.name();
        match self.run_once(pass) {
            Ok(PassReport::ClosedPosts(report)) if !report.failed_threads.is_empty() => {
                tracing::error!(pass = name, failed = ?report.failed_threads, "pass incomplete");
            },
            Ok(PassReport::TokenExpiry(report)) if !report.failures.is_empty() => {
                tracing::error!(pass = name, failures = report.failures.len(), "pass incomplete");
            },
            Ok(PassReport::UnusedBoards(boards)) if !boards.is_empty() => {
                tracing::info!(pass = name, ?boards, "unused boards found");
            },
            Ok(report) => tracing::debug!(pass = name, ?report, "pass complete"),
            Err(e) => tracing::error!(pass = name, error = %e, "pass failed"),
        }
    }

    async fn run_pass(self, pass: Pass, shutdown: CancellationToken) {
        let every = pass.interval(&self.config).max(Duration::from_millis(1));
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(pass),
            }
        }
        tracing::debug!(pass = pass.name(), "upkeep pass stopped");
    }

    /// Start every pass on its own timer. Each runs once immediately.
    pub fn spawn(self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        Pass::ALL
            .into_iter()
            .map(|pass| tokio::spawn(self.clone().run_pass(pass, shutdown.clone())))
            .collect()
    }
}
