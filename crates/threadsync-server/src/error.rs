//! Server error types.

use std::fmt;

use thiserror::Error;
use threadsync_core::SpliceError;
use threadsync_proto::{ErrorPayload, ProtocolError};

use crate::{
    collaborators::{HashError, ImageError, ParseError},
    storage::StorageError,
};

/// Client-caused request failures.
///
/// Reported to the originating client only. A rejected request changes no
/// persisted state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Message could not be decoded
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    /// Board is not hosted, or does not accept this request
    #[error("invalid board: {0}")]
    InvalidBoard(String),

    /// Thread does not exist on the requested board
    #[error("invalid thread: {0}")]
    InvalidThread(u64),

    /// Sync counter is outside the thread's log
    #[error("invalid counter {ctr} for log of {log_len} entries")]
    InvalidCounter {
        /// Requested counter
        ctr: i64,
        /// Current log length
        log_len: u64,
    },

    /// Board refuses new posts
    #[error("board is read-only: {0}")]
    ReadOnlyBoard(String),

    /// Thread refuses replies
    #[error("thread is locked: {0}")]
    ThreadLocked(u64),

    /// Reply carries neither text nor an image
    #[error("no text or image")]
    NoTextOrImage,

    /// Image token is missing, overlong, unknown or expired
    #[error("invalid image token")]
    InvalidImageToken,

    /// Image name is missing
    #[error("no image name")]
    NoImageName,

    /// Image name exceeds the length limit
    #[error("image name too long")]
    ImageNameTooLong,

    /// Reply attempted without synchronising to a thread
    #[error("not synchronised to a thread")]
    NotSynced,

    /// Edit or close attempted without an open post
    #[error("no open post")]
    NoOpenPost,

    /// Splice cannot be applied to the open post
    #[error("invalid splice: {0}")]
    InvalidSplice(SpliceError),

    /// Post body exceeds the length limit
    #[error("body exceeds {max} chars")]
    BodyTooLong {
        /// Configured maximum
        max: usize,
    },

    /// Post field failed validation
    #[error("invalid post: {0}")]
    InvalidPost(#[from] ParseError),
}

impl Rejection {
    /// Numeric code reported to the client.
    pub fn code(&self) -> u16 {
        match self {
            Self::Malformed(_) => ErrorPayload::MALFORMED,
            Self::InvalidBoard(_) => ErrorPayload::INVALID_BOARD,
            Self::InvalidThread(_) => ErrorPayload::INVALID_THREAD,
            Self::InvalidCounter { .. } => ErrorPayload::INVALID_COUNTER,
            Self::ReadOnlyBoard(_) => ErrorPayload::READ_ONLY_BOARD,
            Self::ThreadLocked(_) => ErrorPayload::THREAD_LOCKED,
            Self::NoTextOrImage => ErrorPayload::NO_TEXT_OR_IMAGE,
            Self::InvalidImageToken | Self::NoImageName | Self::ImageNameTooLong => {
                ErrorPayload::INVALID_IMAGE
            },
            Self::NotSynced => ErrorPayload::NOT_SYNCED,
            Self::NoOpenPost => ErrorPayload::NO_OPEN_POST,
            Self::InvalidSplice(_) => ErrorPayload::INVALID_SPLICE,
            Self::BodyTooLong { .. } => ErrorPayload::BODY_TOO_LONG,
            Self::InvalidPost(_) => ErrorPayload::INVALID_POST,
        }
    }

    /// Client-facing report.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}

/// Errors from handling one client request.
#[derive(Error, Debug)]
pub enum RequestError {
    /// Client-caused; no state was changed
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Store failure; the request may be retried
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Server-side encoding failure
    #[error("encoding error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An external collaborator failed
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl RequestError {
    /// Client-facing report. Server-side failures are not described.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Rejected(rejection) => rejection.to_payload(),
            _ => ErrorPayload::new(ErrorPayload::INTERNAL, "internal server error"),
        }
    }
}

impl From<HashError> for RequestError {
    fn from(err: HashError) -> Self {
        Self::Collaborator(err.to_string())
    }
}

impl From<ImageError> for RequestError {
    fn from(err: ImageError) -> Self {
        Self::Collaborator(err.to_string())
    }
}

impl From<ParseError> for RequestError {
    fn from(err: ParseError) -> Self {
        Self::Rejected(Rejection::InvalidPost(err))
    }
}

/// Errors from a single upkeep pass.
#[derive(Error, Debug)]
pub enum UpkeepError {
    /// Store failure before any work was done
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors that can occur in the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unknown board, etc.).
    ///
    /// These are fatal errors that prevent server startup. Fix configuration
    /// and restart.
    Config(String),

    /// Transport/network error (connection failure, handshake error, etc.).
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    Transport(String),

    /// Store error during startup.
    Storage(StorageError),

    /// Internal error (unexpected state, logic bug, etc.).
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
