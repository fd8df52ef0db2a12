//! Message type codes and the framed encoding.
//!
//! # Invariants
//!
//! - Every encoded message starts with exactly two ASCII digits naming a
//!   [`MessageType`].
//! - `decode_message(encode_message(t, p))` yields `t` and the JSON bytes of
//!   `p` unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    errors::{ProtocolError, Result},
    payloads::{ReplyCreationRequest, SpliceRequest, SyncRequest, ThreadCreationRequest},
};

/// Message types shared by client requests, server responses and log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Rejection or failure report sent to the client
    Invalid = 0,
    /// Thread creation request and its response
    InsertThread = 1,
    /// Reply creation request; as a log entry, the created post
    InsertPost = 2,
    /// Edit of an open post's body
    Splice = 5,
    /// Close of an open post
    ClosePost = 6,
    /// Feed subscription request and its acknowledgment
    Synchronise = 30,
}

impl MessageType {
    /// Numeric wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Message type for a numeric wire code. `None` for unknown codes.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Invalid),
            1 => Some(Self::InsertThread),
            2 => Some(Self::InsertPost),
            5 => Some(Self::Splice),
            6 => Some(Self::ClosePost),
            30 => Some(Self::Synchronise),
            _ => None,
        }
    }
}

/// Encode a message: two-digit type prefix followed by the JSON payload.
pub fn encode_message<T: Serialize + ?Sized>(ty: MessageType, payload: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    let code = ty.code();
    let mut buf = BytesMut::with_capacity(2 + json.len());
    buf.put_u8(b'0' + code / 10);
    buf.put_u8(b'0' + code % 10);
    buf.put_slice(&json);

    debug_assert_eq!(buf.len(), 2 + json.len());
    Ok(buf.freeze())
}

/// Split a message into its type and raw payload bytes.
pub fn decode_message(message: &[u8]) -> Result<(MessageType, &[u8])> {
    let [hi, lo, payload @ ..] = message else {
        return Err(ProtocolError::Truncated { len: message.len() });
    };

    if !hi.is_ascii_digit() || !lo.is_ascii_digit() {
        return Err(ProtocolError::InvalidPrefix([*hi, *lo]));
    }

    let code = (hi - b'0') * 10 + (lo - b'0');
    let ty = MessageType::from_code(code).ok_or(ProtocolError::UnknownType(code))?;

    Ok((ty, payload))
}

/// Deserialize a JSON payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Typed client request decoded from an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Attach to a board or thread feed
    Synchronise(SyncRequest),
    /// Create a thread
    InsertThread(ThreadCreationRequest),
    /// Create a reply in the synchronised thread
    InsertPost(ReplyCreationRequest),
    /// Edit the open post
    Splice(SpliceRequest),
    /// Close the open post
    ClosePost,
}

impl Request {
    /// Decode an inbound message.
    ///
    /// `Invalid` is a server-to-client message and is refused here.
    pub fn decode(message: &[u8]) -> Result<Self> {
        let (ty, payload) = decode_message(message)?;

        match ty {
            MessageType::Synchronise => Ok(Self::Synchronise(decode_payload(payload)?)),
            MessageType::InsertThread => Ok(Self::InsertThread(decode_payload(payload)?)),
            MessageType::InsertPost => Ok(Self::InsertPost(decode_payload(payload)?)),
            MessageType::Splice => Ok(Self::Splice(decode_payload(payload)?)),
            MessageType::ClosePost => Ok(Self::ClosePost),
            MessageType::Invalid => Err(ProtocolError::UnexpectedType(ty)),
        }
    }

    /// Message type this request arrived as.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Synchronise(_) => MessageType::Synchronise,
            Self::InsertThread(_) => MessageType::InsertThread,
            Self::InsertPost(_) => MessageType::InsertPost,
            Self::Splice(_) => MessageType::Splice,
            Self::ClosePost => MessageType::ClosePost,
        }
    }
}
