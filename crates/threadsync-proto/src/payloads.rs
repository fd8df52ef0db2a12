//! JSON payloads carried by each message type.
//!
//! Request fields a client may omit default to empty values, so that
//! validation (empty body, missing image name, ...) happens in one place on
//! the server instead of surfacing as decode errors.

use serde::{Deserialize, Serialize};

/// Feed subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Board identifier
    pub board: String,
    /// Thread identifier, or 0 for a board-wide subscription
    #[serde(default)]
    pub thread: u64,
    /// Number of log entries the client has already seen. Signed so that a
    /// negative claim can be decoded and rejected explicitly.
    #[serde(default)]
    pub ctr: i64,
}

/// Image attachment request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Hide the thumbnail behind a spoiler
    #[serde(default)]
    pub spoiler: bool,
    /// Token issued by the image processor
    #[serde(default)]
    pub token: String,
    /// Original file name
    #[serde(default)]
    pub name: String,
}

impl ImageRequest {
    /// Whether the request names an image at all.
    pub fn is_present(&self) -> bool {
        !self.token.is_empty() && !self.name.is_empty()
    }
}

/// Fields shared by thread and reply creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCommon {
    /// Image attachment
    #[serde(default)]
    pub image: ImageRequest,
    /// Poster name, optionally with a `#tripcode` suffix
    #[serde(default)]
    pub name: String,
    /// Email field (`sage` suppresses bumping)
    #[serde(default)]
    pub email: String,
    /// Staff authentication level
    #[serde(default)]
    pub auth: String,
    /// Post password for later deletion
    #[serde(default)]
    pub password: String,
}

/// Anti-automation challenge response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Captcha {
    /// Challenge identifier
    #[serde(default, rename = "captchaID")]
    pub captcha_id: String,
    /// Solution text
    #[serde(default)]
    pub solution: String,
}

/// Thread creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCreationRequest {
    /// Common post fields
    #[serde(flatten)]
    pub common: PostCommon,
    /// Thread subject
    #[serde(default)]
    pub subject: String,
    /// Target board
    pub board: String,
    /// Challenge response
    #[serde(flatten)]
    pub captcha: Captcha,
}

/// Reply creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyCreationRequest {
    /// Common post fields
    #[serde(flatten)]
    pub common: PostCommon,
    /// Initial body text
    #[serde(default)]
    pub body: String,
}

/// Edit of the open post's body: replace `len` chars at `start` with `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceRequest {
    /// Char offset into the current body
    pub start: usize,
    /// Number of chars to replace
    #[serde(default)]
    pub len: usize,
    /// Replacement text
    #[serde(default)]
    pub text: String,
}

/// Response to a thread creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCreationResponse {
    /// One of [`Self::CREATED`] or [`Self::CAPTCHA_REJECTED`]
    pub code: u8,
    /// Allocated thread identifier (0 when not created)
    pub id: u64,
}

impl ThreadCreationResponse {
    /// Thread was created.
    pub const CREATED: u8 = 0;
    /// Challenge failed; nothing was written.
    pub const CAPTCHA_REJECTED: u8 = 1;

    /// Successful creation of thread `id`.
    pub fn created(id: u64) -> Self {
        Self { code: Self::CREATED, id }
    }

    /// Failed challenge.
    pub fn captcha_rejected() -> Self {
        Self { code: Self::CAPTCHA_REJECTED, id: 0 }
    }
}

/// Image as published in post messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMessage {
    /// Content hash of the processed file
    #[serde(rename = "SHA1")]
    pub sha1: String,
    /// File type tag assigned by the processor
    pub file_type: String,
    /// Width, height, thumbnail width, thumbnail height
    pub dims: [u16; 4],
    /// File size in bytes
    pub size: u64,
    /// Thumbnail hidden behind a spoiler
    pub spoiler: bool,
    /// Display name (extension stripped)
    pub name: String,
}

/// Post as published in `InsertPost` log entries.
///
/// Carries no credentials or network identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessage {
    /// Post identifier
    pub id: u64,
    /// Still being edited by its author
    pub editing: bool,
    /// Creation time, Unix seconds
    pub time: u64,
    /// Body text
    pub body: String,
    /// Poster name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Tripcode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trip: String,
    /// Formatted email
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    /// Attached image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageMessage>,
}

/// Splice as published in `Splice` log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceMessage {
    /// Post being edited
    pub id: u64,
    /// Char offset into the body before the edit
    pub start: usize,
    /// Number of chars replaced
    pub len: usize,
    /// Replacement text
    pub text: String,
}

/// Error payload for `Invalid` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the kind of failure
    pub code: u16,
    /// Human-readable description
    pub message: String,
}

impl ErrorPayload {
    /// Request could not be decoded.
    pub const MALFORMED: u16 = 0x0001;
    /// Board does not exist.
    pub const INVALID_BOARD: u16 = 0x0002;
    /// Thread does not exist on the board.
    pub const INVALID_THREAD: u16 = 0x0003;
    /// Last-seen counter outside `[0, log length]`.
    pub const INVALID_COUNTER: u16 = 0x0004;
    /// Board does not accept posts.
    pub const READ_ONLY_BOARD: u16 = 0x0005;
    /// Thread does not accept replies.
    pub const THREAD_LOCKED: u16 = 0x0006;
    /// Reply has neither text nor image.
    pub const NO_TEXT_OR_IMAGE: u16 = 0x0007;
    /// Image token or name rejected.
    pub const INVALID_IMAGE: u16 = 0x0008;
    /// Reply sent without a thread subscription.
    pub const NOT_SYNCED: u16 = 0x0009;
    /// Edit sent without an open post.
    pub const NO_OPEN_POST: u16 = 0x000A;
    /// Splice bounds or result rejected.
    pub const INVALID_SPLICE: u16 = 0x000B;
    /// Post fields rejected by the parser.
    pub const INVALID_POST: u16 = 0x000C;
    /// Body would exceed the maximum length.
    pub const BODY_TOO_LONG: u16 = 0x000D;
    /// Transient server-side failure; the request may be retried.
    pub const INTERNAL: u16 = 0x00FF;

    /// Construct an error payload.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}
