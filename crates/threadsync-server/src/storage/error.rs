use thiserror::Error;

/// Errors reported by a [`Storage`](super::Storage) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Document does not exist
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Document collection
        kind: &'static str,
        /// Document key
        key: String,
    },

    /// Document already exists, or an update referenced state that changed
    #[error("{kind} conflict: {key}")]
    Conflict {
        /// Document collection
        kind: &'static str,
        /// Document key
        key: String,
    },

    /// Backend I/O failure. May succeed on retry.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Backend is not reachable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub(crate) fn thread_not_found(id: u64) -> Self {
        Self::NotFound { kind: "thread", key: id.to_string() }
    }

    pub(crate) fn post_not_found(id: u64) -> Self {
        Self::NotFound { kind: "post", key: id.to_string() }
    }

    /// Whether the error reports a missing document rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
