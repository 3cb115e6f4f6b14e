//! ## Overlay frame format
//!
//! Every overlay connection speaks a line-oriented request/response frame
//! format. A frame ("box") is a sequence of `Key: value` header lines
//! terminated by an empty line, rfc2822-inspired although not -compliant.
//!
//! Requests name a command and may carry an `-Ask` tag when a response is
//! wanted; responses carry `-Answer` with the same tag, or `-Error` plus an
//! error code. A body is announced with `-Content-Length` and follows the
//! terminating empty line as raw bytes. Structured multi-valued headers
//! (the listener list of an inbound reply) are encoded as nested boxes whose
//! lines are indented with a single space.
//!
//! ```text
//! C: -Command: listen
//! C: -Ask: 1
//! C: From: glyph@example.com
//! C: Protocols: q2q-example, q2q-example2
//! C: Description: some simple protocols
//! C:
//! S: -Answer: 1
//! S:
//! ```

pub mod frame;
pub mod reader;

pub use self::{
    frame::{Frame, FrameKind, Headers},
    reader::FrameReader,
};

use base64::{Engine, engine::general_purpose::STANDARD};

use std::fmt;

/// The header section of a single frame may not exceed this.
pub const MAX_HEAD_SIZE: usize = 1024 * 1024;

/// Bodies above this size are refused outright.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    HeadTooLarge,
    BodyTooLarge(usize),
    MalformedLine(String),
    IllegalKey(String),
    IllegalValue(String),
    BadTag(String),
    AmbiguousKind,
    MissingKind,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Encode an opaque binary value for use as a header value.
///
/// # Test
///
/// ```
/// assert_eq!(q2q_server_codec::encode_blob(b"cert bytes"), "Y2VydCBieXRlcw==");
/// ```
pub fn encode_blob(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a header value produced by [`encode_blob`].
pub fn decode_blob(value: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(value.trim())
        .map_err(|_| Error::IllegalValue(value.to_string()))
}
