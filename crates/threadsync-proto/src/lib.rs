//! Wire messages for the threadsync discussion-board backbone.
//!
//! Every message exchanged with a client, and every entry stored in a thread's
//! log, is a two-digit ASCII message type followed by a JSON payload:
//!
//! ```text
//! ┌──────────┬──────────────────────────┐
//! │ type     │ payload                  │
//! │ 2 digits │ JSON, variable length    │
//! └──────────┴──────────────────────────┘
//! ```
//!
//! Log entries are encoded once, when they are appended, and afterwards only
//! ever moved around as opaque [`bytes::Bytes`]. The server never re-encodes
//! a stored entry, so a replayed backlog is byte-identical to what live
//! subscribers received.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod message;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use message::{MessageType, Request, decode_message, decode_payload, encode_message};
pub use payloads::{
    Captcha, ErrorPayload, ImageMessage, ImageRequest, PostCommon, PostMessage,
    ReplyCreationRequest, SpliceMessage, SpliceRequest, SyncRequest, ThreadCreationRequest,
    ThreadCreationResponse,
};
