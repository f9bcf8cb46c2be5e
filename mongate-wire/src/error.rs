//! Wire error types and server error codes.

use bson::{doc, Document};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing or unframing a wire message.
///
/// Every decode error is fatal for the connection it occurred on: the byte
/// stream carries no framing signal other than `messageLength`, so once a
/// message has been misread the stream cannot be resynchronized.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid message length: {0} (must be between 16 and {max})", max = crate::MAX_MESSAGE_SIZE)]
    InvalidMessageLength(i32),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unknown opcode: {0}")]
    UnknownOpCode(i32),

    #[error("truncated message: needed {needed} more bytes while reading {what}")]
    Truncated { what: &'static str, needed: usize },

    #[error("{remaining} unexpected trailing bytes after {what}")]
    TrailingBytes { what: &'static str, remaining: usize },

    #[error("invalid document length: {0}")]
    InvalidDocumentLength(i32),

    #[error("unterminated C string")]
    UnterminatedCString,

    #[error("invalid UTF-8 in C string")]
    InvalidUtf8,

    #[error("unknown section kind: {0}")]
    UnknownSectionKind(u8),

    #[error("invalid section size: {0}")]
    InvalidSectionSize(i32),

    #[error("invalid cursor count: {0}")]
    InvalidCursorCount(i32),

    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown compressor id: {0}")]
    UnknownCompressor(u8),

    #[error("unknown compressor name: {0}")]
    UnknownCompressorName(String),

    #[error("{compressor} compression failed: {message}")]
    Compression {
        compressor: &'static str,
        message: String,
    },

    #[error("uncompressed size mismatch: header says {declared}, payload is {actual}")]
    UncompressedSizeMismatch { declared: i32, actual: usize },

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable server error codes returned inline in `{ok: 0}` reply documents.
///
/// The numeric values are part of the wire contract with unmodified clients
/// and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    Unauthorized,
    IllegalOperation,
    CursorNotFound,
    MaxTimeMSExpired,
    CommandNotFound,
    InvalidNamespace,
    CommandNotSupported,
    Interrupted,
}

impl ErrorCode {
    /// Returns the numeric code.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::Unauthorized => 13,
            ErrorCode::IllegalOperation => 20,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::MaxTimeMSExpired => 50,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::CommandNotSupported => 115,
            ErrorCode::Interrupted => 11601,
        }
    }

    /// Returns the canonical code name.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::IllegalOperation => "IllegalOperation",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::MaxTimeMSExpired => "MaxTimeMSExpired",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::CommandNotSupported => "CommandNotSupported",
            ErrorCode::Interrupted => "Interrupted",
        }
    }

    /// Looks up a code by its numeric value.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => ErrorCode::InternalError,
            2 => ErrorCode::BadValue,
            9 => ErrorCode::FailedToParse,
            13 => ErrorCode::Unauthorized,
            20 => ErrorCode::IllegalOperation,
            43 => ErrorCode::CursorNotFound,
            50 => ErrorCode::MaxTimeMSExpired,
            59 => ErrorCode::CommandNotFound,
            73 => ErrorCode::InvalidNamespace,
            115 => ErrorCode::CommandNotSupported,
            11601 => ErrorCode::Interrupted,
            _ => return None,
        })
    }

    /// Returns whether a client may reasonably retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Interrupted | ErrorCode::MaxTimeMSExpired | ErrorCode::InternalError
        )
    }

    /// Renders the inline error reply `{ok: 0, errmsg, code, codeName}`.
    pub fn error_document(&self, message: impl Into<String>) -> Document {
        doc! {
            "ok": 0,
            "errmsg": message.into(),
            "code": self.code(),
            "codeName": self.name(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}
