//! Protocol error types.

use thiserror::Error;

use crate::MessageType;

/// Errors produced while encoding or decoding wire messages.
///
/// All variants describe malformed input or an unencodable payload. None of
/// them are transient: resending the same bytes fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message is shorter than the two-byte type prefix
    #[error("message too short: {len} bytes")]
    Truncated {
        /// Length of the received message
        len: usize,
    },

    /// Type prefix contains a non-digit byte
    #[error("invalid message type prefix: {0:?}")]
    InvalidPrefix([u8; 2]),

    /// Type prefix is well formed but names no known message
    #[error("unknown message type: {0:02}")]
    UnknownType(u8),

    /// Message type is valid but not accepted in this direction
    #[error("unexpected message type: {0:?}")]
    UnexpectedType(MessageType),

    /// Payload could not be serialized
    #[error("payload encoding failed: {0}")]
    Encode(String),

    /// Payload could not be deserialized
    #[error("payload decoding failed: {0}")]
    Decode(String),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
