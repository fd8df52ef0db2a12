//! Thread documents and the records that live beside them.
//!
//! A [`Thread`] is the unit of atomicity: its counters, lock flag, post map
//! and append-only log change together or not at all. The storage layer
//! enforces that; the types here only describe the state and the pure
//! transitions on it (closing, splicing, session pruning).
//!
//! All timestamps are Unix seconds.

use std::{collections::BTreeMap, net::IpAddr};

use bytes::Bytes;
use thiserror::Error;
use threadsync_proto::{ImageMessage, PostMessage};

/// Image metadata produced by the image processor, shared by every post
/// that attaches the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCommon {
    /// Content hash, also the image's storage key
    pub sha1: String,
    /// File type tag
    pub file_type: String,
    /// Width, height, thumbnail width, thumbnail height
    pub dims: [u16; 4],
    /// File size in bytes
    pub size: u64,
}

/// Image as attached to a single post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Processed file metadata
    pub common: ImageCommon,
    /// Thumbnail hidden behind a spoiler
    pub spoiler: bool,
    /// Display name, without its final extension
    pub name: String,
}

impl Image {
    /// Attach `common` under the uploaded file name. The final extension is
    /// stripped from the display name.
    pub fn new(common: ImageCommon, spoiler: bool, file_name: &str) -> Self {
        Self { common, spoiler, name: strip_extension(file_name).to_owned() }
    }

    /// Public projection for log entries.
    pub fn to_message(&self) -> ImageMessage {
        ImageMessage {
            sha1: self.common.sha1.clone(),
            file_type: self.common.file_type.clone(),
            dims: self.common.dims,
            size: self.common.size,
            spoiler: self.spoiler,
            name: self.name.clone(),
        }
    }
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains('/') => stem,
        _ => name,
    }
}

/// Reasons a splice cannot be applied to a post body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpliceError {
    /// Replaced range extends past the end of the body
    #[error("splice range {start}+{len} exceeds body of {body_len} chars")]
    OutOfBounds {
        /// Char offset of the splice
        start: usize,
        /// Number of chars to replace
        len: usize,
        /// Current body length in chars
        body_len: usize,
    },

    /// Splice would neither remove nor insert anything
    #[error("empty splice")]
    Empty,

    /// Resulting body would be longer than allowed
    #[error("body of {len} chars exceeds maximum of {max}")]
    TooLong {
        /// Resulting body length in chars
        len: usize,
        /// Configured maximum
        max: usize,
    },
}

/// A single post. The thread's opening post shares its id with the thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Post identifier, unique across all threads
    pub id: u64,
    /// Owning thread
    pub op: u64,
    /// Still being composed by its author
    pub editing: bool,
    /// Creation time
    pub time: u64,
    /// Body text
    pub body: String,
    /// Poster name
    pub name: String,
    /// Tripcode derived from the name field
    pub trip: String,
    /// Formatted email
    pub email: String,
    /// Attached image
    pub image: Option<Image>,
    /// Author network identity
    pub ip: Option<IpAddr>,
    /// Hashed post password
    pub password: Vec<u8>,
}

impl Post {
    /// Public projection for `InsertPost` log entries. Omits the author's
    /// network identity and password hash.
    pub fn to_message(&self) -> PostMessage {
        PostMessage {
            id: self.id,
            editing: self.editing,
            time: self.time,
            body: self.body.clone(),
            name: self.name.clone(),
            trip: self.trip.clone(),
            email: self.email.clone(),
            image: self.image.as_ref().map(Image::to_message),
        }
    }

    /// Body length in chars.
    pub fn body_len(&self) -> usize {
        self.body.chars().count()
    }

    /// Whether the post is still open and older than `cutoff`.
    pub fn is_stale(&self, cutoff: u64) -> bool {
        self.editing && self.time < cutoff
    }

    /// Replace `len` chars at char offset `start` with `text`.
    ///
    /// The body is left untouched on error.
    pub fn splice(
        &mut self,
        start: usize,
        len: usize,
        text: &str,
        max_len: usize,
    ) -> Result<(), SpliceError> {
        let body_len = self.body_len();
        let end = start
            .checked_add(len)
            .filter(|&end| end <= body_len)
            .ok_or(SpliceError::OutOfBounds { start, len, body_len })?;

        if len == 0 && text.is_empty() {
            return Err(SpliceError::Empty);
        }

        let new_len = body_len - len + text.chars().count();
        if new_len > max_len {
            return Err(SpliceError::TooLong { len: new_len, max: max_len });
        }

        let byte_start = char_to_byte(&self.body, start);
        let byte_end = char_to_byte(&self.body, end);
        self.body.replace_range(byte_start..byte_end, text);

        debug_assert_eq!(self.body_len(), new_len);
        Ok(())
    }
}

fn char_to_byte(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map_or(s.len(), |(byte, _)| byte)
}

/// Thread document.
///
/// # Invariants
///
/// - `log` only grows by appending; it is never truncated or reordered.
/// - `post_ctr` equals the number of reply-creating entries in `log`.
/// - `posts` always contains the opening post under key `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    /// Thread identifier, equal to the opening post's id
    pub id: u64,
    /// Board the thread is filed under
    pub board: String,
    /// Subject line
    pub subject: String,
    /// Replies are refused while set
    pub locked: bool,
    /// Sort time on the board index
    pub bump_time: u64,
    /// Time of the latest reply
    pub reply_time: u64,
    /// Number of replies
    pub post_ctr: u64,
    /// Number of posts with images, including the opening post
    pub image_ctr: u64,
    /// Encoded event entries in commit order
    pub log: Vec<Bytes>,
    /// Posts by id
    pub posts: BTreeMap<u64, Post>,
}

impl Thread {
    /// New thread around its opening post. The log starts empty.
    pub fn new(board: impl Into<String>, subject: impl Into<String>, op: Post) -> Self {
        let id = op.id;
        let now = op.time;
        let image_ctr = u64::from(op.image.is_some());

        Self {
            id,
            board: board.into(),
            subject: subject.into(),
            locked: false,
            bump_time: now,
            reply_time: now,
            post_ctr: 0,
            image_ctr,
            log: Vec::new(),
            posts: BTreeMap::from([(id, op)]),
        }
    }

    /// Number of log entries.
    pub fn log_len(&self) -> u64 {
        self.log.len() as u64
    }

    /// Latest creation time of any post in the thread.
    pub fn latest_post_time(&self) -> u64 {
        self.posts.values().map(|post| post.time).max().unwrap_or(self.reply_time)
    }

    /// Ids of open posts created before `cutoff`.
    pub fn stale_posts(&self, cutoff: u64) -> Vec<u64> {
        self.posts.values().filter(|post| post.is_stale(cutoff)).map(|post| post.id).collect()
    }
}

/// A login session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque session token
    pub token: String,
    /// Expiry time
    pub expires: u64,
}

impl Session {
    /// A session is expired once its expiry time has been reached.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires <= now
    }
}

/// Account document holding its login sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Account identifier
    pub id: String,
    /// Sessions keyed by token
    pub sessions: Vec<Session>,
}

/// Short-lived reservation of a processed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageToken {
    /// Token handed to the uploading client
    pub token: String,
    /// Expiry time
    pub expires: u64,
    /// Content hash of the reserved image
    pub sha1: String,
}

impl ImageToken {
    /// A token stays usable through its expiry second.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires < now
    }
}

/// Board document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    /// Board identifier
    pub id: String,
    /// Creation time
    pub created: u64,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn post(id: u64, body: &str) -> Post {
        Post {
            id,
            op: id,
            editing: true,
            time: 100,
            body: body.to_owned(),
            name: String::new(),
            trip: String::new(),
            email: String::new(),
            image: None,
            ip: None,
            password: Vec::new(),
        }
    }

    fn image_common() -> ImageCommon {
        ImageCommon { sha1: "abc".into(), file_type: "png".into(), dims: [1, 2, 3, 4], size: 10 }
    }

    #[test]
    fn image_name_loses_final_extension() {
        assert_eq!(Image::new(image_common(), false, "cat.png").name, "cat");
        assert_eq!(Image::new(image_common(), false, "a.tar.gz").name, "a.tar");
        assert_eq!(Image::new(image_common(), false, "noext").name, "noext");
    }

    #[test]
    fn public_projection_hides_credentials() {
        let mut p = post(3, "hi");
        p.ip = Some("127.0.0.1".parse().unwrap());
        p.password = b"hash".to_vec();
        p.image = Some(Image::new(image_common(), true, "x.jpg"));

        let msg = p.to_message();
        assert_eq!(msg.id, 3);
        assert_eq!(msg.body, "hi");
        let image = msg.image.unwrap();
        assert!(image.spoiler);
        assert_eq!(image.name, "x");

        let rendered = format!("{:?}", p.to_message());
        assert!(!rendered.contains("127.0.0.1"));
        assert!(!rendered.contains("hash"));
    }

    #[test]
    fn splice_counts_chars_not_bytes() {
        let mut p = post(1, "héllo");
        p.splice(1, 1, "e", 2000).unwrap();
        assert_eq!(p.body, "hello");

        p.splice(5, 0, " wörld", 2000).unwrap();
        assert_eq!(p.body, "hello wörld");
    }

    #[test]
    fn splice_rejects_out_of_bounds() {
        let mut p = post(1, "abc");
        assert_eq!(
            p.splice(2, 2, "x", 2000),
            Err(SpliceError::OutOfBounds { start: 2, len: 2, body_len: 3 })
        );
        assert_eq!(
            p.splice(usize::MAX, 1, "x", 2000),
            Err(SpliceError::OutOfBounds { start: usize::MAX, len: 1, body_len: 3 })
        );
        assert_eq!(p.body, "abc");
    }

    #[test]
    fn splice_rejects_empty_and_too_long() {
        let mut p = post(1, "abc");
        assert_eq!(p.splice(1, 0, "", 2000), Err(SpliceError::Empty));
        assert_eq!(p.splice(3, 0, "de", 4), Err(SpliceError::TooLong { len: 5, max: 4 }));
        assert_eq!(p.body, "abc");

        // Pure deletion is allowed.
        p.splice(0, 1, "", 4).unwrap();
        assert_eq!(p.body, "bc");
    }

    #[test]
    fn new_thread_counts_opening_image() {
        let mut op = post(9, "");
        let plain = Thread::new("a", "s", op.clone());
        assert_eq!(plain.image_ctr, 0);
        assert_eq!(plain.post_ctr, 0);
        assert!(plain.log.is_empty());
        assert_eq!(plain.bump_time, 100);

        op.image = Some(Image::new(image_common(), false, "f.png"));
        let with_image = Thread::new("a", "s", op);
        assert_eq!(with_image.image_ctr, 1);
        assert!(with_image.posts.contains_key(&9));
    }

    #[test]
    fn stale_posts_only_lists_open_old_posts() {
        let mut thread = Thread::new("a", "s", post(1, ""));
        let mut young = post(2, "");
        young.time = 500;
        let mut closed = post(3, "");
        closed.editing = false;
        thread.posts.insert(2, young);
        thread.posts.insert(3, closed);

        assert_eq!(thread.stale_posts(200), vec![1]);
        assert_eq!(thread.latest_post_time(), 500);
    }

    proptest! {
        /// Splicing never panics and either applies exactly or leaves the
        /// body untouched.
        #[test]
        fn prop_splice_is_all_or_nothing(
            body in "[a-zé ]{0,20}",
            start in 0usize..25,
            len in 0usize..25,
            text in "[a-zü]{0,10}",
        ) {
            let mut p = post(1, &body);
            let before = p.body.clone();
            match p.splice(start, len, &text, 30) {
                Ok(()) => {
                    // ORACLE: same edit computed on a char vector
                    let mut chars: Vec<char> = before.chars().collect();
                    chars.splice(start..start + len, text.chars());
                    prop_assert_eq!(p.body, chars.into_iter().collect::<String>());
                }
                Err(_) => prop_assert_eq!(p.body, before),
            }
        }
    }

    #[test]
    fn token_is_usable_through_its_expiry_second() {
        let token = ImageToken { token: "t".into(), expires: 100, sha1: "s".into() };

        assert!(!token.is_expired(99));
        assert!(!token.is_expired(100));
        assert!(token.is_expired(101));
    }

    #[test]
    fn session_expires_at_its_expiry_second() {
        let session = Session { token: "s".into(), expires: 100 };

        assert!(!session.is_expired(99));
        assert!(session.is_expired(100));
    }
}
