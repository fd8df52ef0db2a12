//! External collaborators of the creation pipeline and the upkeep scheduler.
//!
//! Board configuration, captcha verification, post field parsing, password
//! hashing and image bookkeeping are owned by other services in a full
//! deployment. Each is a trait here, with a small default implementation so
//! the server runs standalone.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError},
};

use argon2::{Argon2, PasswordHasher as _, password_hash::SaltString};
use sha2::{Digest, Sha256};
use thiserror::Error;
use threadsync_core::ImageCommon;
use threadsync_proto::Captcha;

use crate::config::BoardSettings;

/// Aggregate board that can be synchronised to but never posted in.
pub const META_BOARD: &str = "all";

const MAX_NAME_LEN: usize = 50;
const MAX_SUBJECT_LEN: usize = 100;
const MAX_PASSWORD_LEN: usize = 50;
const MAX_EMAIL_LEN: usize = 100;
const TRIPCODE_LEN: usize = 10;

/// Posting-related configuration of one board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardConfig {
    /// Refuse new threads and replies
    pub read_only: bool,
    /// Posts never carry images
    pub text_only: bool,
}

/// Source of board configuration.
pub trait BoardDirectory: Send + Sync {
    /// Configuration of `board`. `None` if no such board is hosted.
    fn config(&self, board: &str) -> Option<BoardConfig>;

    /// Whether `board` is the aggregate meta board.
    fn is_meta(&self, board: &str) -> bool {
        board == META_BOARD
    }

    /// Whether `board` may be synchronised to.
    fn is_known(&self, board: &str) -> bool {
        self.is_meta(board) || self.config(board).is_some()
    }
}

/// Fixed set of boards built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticBoards {
    boards: HashMap<String, BoardConfig>,
}

impl StaticBoards {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a board.
    #[must_use]
    pub fn with_board(mut self, id: impl Into<String>, config: BoardConfig) -> Self {
        self.boards.insert(id.into(), config);
        self
    }

    /// Hosted board identifiers.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.boards.keys().map(String::as_str)
    }
}

impl From<&[BoardSettings]> for StaticBoards {
    fn from(settings: &[BoardSettings]) -> Self {
        settings.iter().fold(Self::new(), |boards, board| {
            boards.with_board(
                board.id.clone(),
                BoardConfig { read_only: board.read_only, text_only: board.text_only },
            )
        })
    }
}

impl BoardDirectory for StaticBoards {
    fn config(&self, board: &str) -> Option<BoardConfig> {
        self.boards.get(board).copied()
    }
}

/// Anti-automation challenge check for thread creation.
pub trait CaptchaVerifier: Send + Sync {
    /// Whether the challenge response is valid for a client at `ip`.
    fn verify(&self, captcha: &Captcha, ip: Option<IpAddr>) -> bool;
}

/// Built-in captcha policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptchaPolicy {
    /// Every response passes
    #[default]
    Disabled,
    /// Every response fails, closing thread creation
    RejectAll,
}

impl CaptchaVerifier for CaptchaPolicy {
    fn verify(&self, _captcha: &Captcha, _ip: Option<IpAddr>) -> bool {
        matches!(self, Self::Disabled)
    }
}

/// Post field validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Name field is too long
    #[error("name exceeds {max} chars")]
    NameTooLong {
        /// Maximum length
        max: usize,
    },

    /// Thread subject is missing
    #[error("no subject")]
    NoSubject,

    /// Thread subject is too long
    #[error("subject exceeds {max} chars")]
    SubjectTooLong {
        /// Maximum length
        max: usize,
    },

    /// Post password is missing
    #[error("no post password")]
    NoPassword,

    /// Post password is too long
    #[error("post password exceeds {max} chars")]
    PasswordTooLong {
        /// Maximum length
        max: usize,
    },
}

/// Parsing of user-supplied post fields.
pub trait PostParser: Send + Sync {
    /// Split a name field into display name and tripcode.
    fn parse_name(&self, name: &str) -> Result<(String, String), ParseError>;

    /// Normalise an email field.
    fn format_email(&self, email: &str) -> String;

    /// Validate and normalise a thread subject.
    fn parse_subject(&self, subject: &str) -> Result<String, ParseError>;

    /// Validate a post password.
    fn verify_password(&self, password: &str) -> Result<(), ParseError>;
}

/// Plain-text field parser.
///
/// A name of the form `name#secret` yields the tripcode
/// `hex(sha256(secret))` truncated to ten characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainParser;

impl PostParser for PlainParser {
    fn parse_name(&self, name: &str) -> Result<(String, String), ParseError> {
        let name = name.trim();
        if name.chars().count() > MAX_NAME_LEN {
            return Err(ParseError::NameTooLong { max: MAX_NAME_LEN });
        }

        match name.split_once('#') {
            Some((display, secret)) if !secret.is_empty() => {
                let mut trip = hex::encode(Sha256::digest(secret.as_bytes()));
                trip.truncate(TRIPCODE_LEN);
                Ok((display.trim().to_owned(), trip))
            },
            Some((display, _)) => Ok((display.trim().to_owned(), String::new())),
            None => Ok((name.to_owned(), String::new())),
        }
    }

    fn format_email(&self, email: &str) -> String {
        email.trim().chars().take(MAX_EMAIL_LEN).collect()
    }

    fn parse_subject(&self, subject: &str) -> Result<String, ParseError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(ParseError::NoSubject);
        }
        if subject.chars().count() > MAX_SUBJECT_LEN {
            return Err(ParseError::SubjectTooLong { max: MAX_SUBJECT_LEN });
        }
        Ok(subject.to_owned())
    }

    fn verify_password(&self, password: &str) -> Result<(), ParseError> {
        if password.is_empty() {
            return Err(ParseError::NoPassword);
        }
        if password.chars().count() > MAX_PASSWORD_LEN {
            return Err(ParseError::PasswordTooLong { max: MAX_PASSWORD_LEN });
        }
        Ok(())
    }
}

/// Password hashing failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("password hashing failed: {0}")]
pub struct HashError(pub String);

/// One-way hashing of post passwords.
pub trait PasswordHasher: Send + Sync {
    /// Hash `password` with the given random salt. The result is opaque.
    fn hash(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>, HashError>;
}

/// Argon2id hasher producing PHC strings.
#[derive(Default)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>, HashError> {
        let salt = SaltString::encode_b64(salt).map_err(|e| HashError(e.to_string()))?;
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| HashError(e.to_string()))?;
        Ok(hash.to_string().into_bytes())
    }
}

/// Image bookkeeping failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// No image with this hash is allocated
    #[error("image not found: {0}")]
    NotFound(String),

    /// Backend failure
    #[error("image store error: {0}")]
    Backend(String),
}

/// Content-addressed store of processed images.
pub trait ImageStore: Send + Sync {
    /// Metadata of an allocated image. `None` if not allocated.
    fn image(&self, sha1: &str) -> Option<ImageCommon>;

    /// Drop one reference to an image, removing it when none remain.
    fn deallocate(&self, sha1: &str) -> Result<(), ImageError>;
}

/// Reference-counted in-memory image store.
#[derive(Clone, Default)]
pub struct MemoryImages {
    inner: Arc<Mutex<HashMap<String, (ImageCommon, u64)>>>,
}

impl MemoryImages {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference to an image, allocating it if needed.
    pub fn allocate(&self, image: ImageCommon) {
        let mut images = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        images.entry(image.sha1.clone()).or_insert((image, 0)).1 += 1;
    }

    /// Current reference count (0 if not allocated).
    pub fn ref_count(&self, sha1: &str) -> u64 {
        let images = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        images.get(sha1).map_or(0, |(_, refs)| *refs)
    }
}

impl ImageStore for MemoryImages {
    fn image(&self, sha1: &str) -> Option<ImageCommon> {
        let images = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        images.get(sha1).map(|(image, _)| image.clone())
    }

    fn deallocate(&self, sha1: &str) -> Result<(), ImageError> {
        let mut images = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, refs) = images.get_mut(sha1).ok_or_else(|| ImageError::NotFound(sha1.into()))?;

        *refs -= 1;
        if *refs == 0 {
            images.remove(sha1);
        }
        Ok(())
    }
}
