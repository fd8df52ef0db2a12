//! Thread and feed invariants.

use std::collections::HashMap;

use threadsync_core::Thread;
use threadsync_proto::{MessageType, decode_message};

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

fn entry_type(entry: &[u8]) -> Option<MessageType> {
    decode_message(entry).ok().map(|(ty, _)| ty)
}

/// Close entries per post id in a thread's log.
fn close_counts(thread: &Thread) -> HashMap<u64, usize> {
    let mut counts = HashMap::new();
    for entry in &thread.log {
        if let Ok((MessageType::ClosePost, payload)) = decode_message(entry) {
            if let Some(id) = std::str::from_utf8(payload).ok().and_then(|s| s.parse().ok()) {
                *counts.entry(id).or_default() += 1;
            }
        }
    }
    counts
}

/// A thread's reply counter equals the number of reply entries in its log.
pub struct PostCounterMatchesLog;

impl Invariant for PostCounterMatchesLog {
    fn name(&self) -> &'static str {
        "PostCounterMatchesLog"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for thread in &state.threads {
            let replies = thread
                .log
                .iter()
                .filter(|entry| entry_type(entry) == Some(MessageType::InsertPost))
                .count() as u64;

            if replies != thread.post_ctr {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "thread {}: post_ctr {} but {} reply entries",
                        thread.id, thread.post_ctr, replies
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A thread's image counter equals the number of its posts with images.
pub struct ImageCounterMatchesPosts;

impl Invariant for ImageCounterMatchesPosts {
    fn name(&self) -> &'static str {
        "ImageCounterMatchesPosts"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for thread in &state.threads {
            let images = thread.posts.values().filter(|post| post.image.is_some()).count() as u64;
            if images != thread.image_ctr {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "thread {}: image_ctr {} but {} posts with images",
                        thread.id, thread.image_ctr, images
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Every closed post has exactly one close entry; open posts have none.
pub struct ClosedPostsLogged;

impl Invariant for ClosedPostsLogged {
    fn name(&self) -> &'static str {
        "ClosedPostsLogged"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for thread in &state.threads {
            let closes = close_counts(thread);
            for post in thread.posts.values() {
                let logged = closes.get(&post.id).copied().unwrap_or(0);
                let expected = usize::from(!post.editing);
                if logged != expected {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "thread {} post {}: editing={} with {} close entries",
                            thread.id, post.id, post.editing, logged
                        ),
                    });
                }
            }
            if let Some(orphan) = closes.keys().find(|id| !thread.posts.contains_key(id)) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("thread {}: close entry for unknown post {orphan}", thread.id),
                });
            }
        }
        Ok(())
    }
}

/// Posts are filed under their own thread, and ids are unique across
/// threads.
pub struct PostsBelongToThread;

impl Invariant for PostsBelongToThread {
    fn name(&self) -> &'static str {
        "PostsBelongToThread"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let mut owners: HashMap<u64, u64> = HashMap::new();
        for thread in &state.threads {
            if !thread.posts.contains_key(&thread.id) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("thread {}: opening post missing", thread.id),
                });
            }
            for post in thread.posts.values() {
                if post.op != thread.id {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "thread {}: post {} claims thread {}",
                            thread.id, post.id, post.op
                        ),
                    });
                }
                if let Some(other) = owners.insert(post.id, thread.id) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "post {} appears in threads {} and {}",
                            post.id, other, thread.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// What a client received is exactly the log slice starting at its counter:
/// no gaps, no duplicates, no reordering.
pub struct FeedIsLogSlice;

impl Invariant for FeedIsLogSlice {
    fn name(&self) -> &'static str {
        "FeedIsLogSlice"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for feed in &state.feeds {
            let Some(thread) = state.thread(feed.thread) else {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("client {}: unknown thread {}", feed.client, feed.thread),
                });
            };

            let from = feed.from as usize;
            let end = from + feed.received.len();
            if end > thread.log.len() {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {} thread {}: received {} entries from {} but log has {}",
                        feed.client,
                        thread.id,
                        feed.received.len(),
                        from,
                        thread.log.len()
                    ),
                });
            }

            if let Some(offset) =
                feed.received.iter().zip(&thread.log[from..end]).position(|(got, want)| got != want)
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {} thread {}: entry {} differs from the log",
                        feed.client,
                        thread.id,
                        from + offset
                    ),
                });
            }
        }
        Ok(())
    }
}
