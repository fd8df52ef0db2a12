//! Per-connection session state.

use std::net::IpAddr;

use crate::{registry::SyncId, sync::FeedCursor};

/// Post a connection currently owns for editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPost {
    /// Post identifier
    pub id: u64,
    /// Owning thread
    pub op: u64,
    /// Board of the owning thread
    pub board: String,
    /// Creation time
    pub time: u64,
}

/// State owned by one connection task.
///
/// # Invariants
///
/// - At most one open post at a time.
/// - At most one feed at a time; `cursor` is set only for thread feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Connection identifier issued by the registry
    pub id: u64,
    /// Remote network identity, if known
    pub ip: Option<IpAddr>,
    /// Feed the connection follows
    pub sync: Option<SyncId>,
    /// Next expected log index of the followed thread
    pub cursor: Option<FeedCursor>,
    /// Post being composed
    pub open_post: Option<OpenPost>,
}

impl Client {
    /// Unsynced client without an open post.
    pub fn new(id: u64, ip: Option<IpAddr>) -> Self {
        Self { id, ip, sync: None, cursor: None, open_post: None }
    }
}
