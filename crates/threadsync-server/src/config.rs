//! Runtime configuration.
//!
//! Every struct has a `Default` matching production settings; the binary
//! overrides fields from command-line arguments.

use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Limits applied by the post creation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingConfig {
    /// Replies stop bumping a thread once it has this many replies
    pub max_bump: u64,
    /// Maximum body length of a post, in chars
    pub max_body_len: usize,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self { max_bump: 1000, max_body_len: 2000 }
    }
}

/// Intervals and thresholds of the upkeep passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpkeepConfig {
    /// How often open posts are checked for staleness
    pub close_posts_every: Duration,
    /// How often expired image tokens are reclaimed
    pub expire_tokens_every: Duration,
    /// How often expired sessions are removed
    pub expire_sessions_every: Duration,
    /// How often boards are audited for inactivity
    pub audit_boards_every: Duration,
    /// Open posts older than this are closed
    pub post_stale_after: Duration,
    /// Boards younger than this are never audit candidates
    pub board_min_age: Duration,
    /// Boards whose newest post is older than this are audit candidates
    pub board_inactive_after: Duration,
}

impl Default for UpkeepConfig {
    fn default() -> Self {
        Self {
            close_posts_every: MINUTE,
            expire_tokens_every: MINUTE,
            expire_sessions_every: 10 * MINUTE,
            audit_boards_every: 60 * MINUTE,
            post_stale_after: 30 * MINUTE,
            board_min_age: WEEK,
            board_inactive_after: WEEK,
        }
    }
}

/// Configuration of one hosted board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSettings {
    /// Board identifier
    pub id: String,
    /// Refuse new threads and replies
    pub read_only: bool,
    /// Posts never carry images
    pub text_only: bool,
}

impl BoardSettings {
    /// Writable board that accepts images.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), read_only: false, text_only: false }
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8000")
    pub bind_address: String,
    /// Hosted boards
    pub boards: Vec<BoardSettings>,
    /// Post creation limits
    pub posting: PostingConfig,
    /// Upkeep schedule
    pub upkeep: UpkeepConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            boards: vec![BoardSettings { text_only: true, ..BoardSettings::new("a") }],
            posting: PostingConfig::default(),
            upkeep: UpkeepConfig::default(),
        }
    }
}
