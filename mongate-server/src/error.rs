//! Server error types and their inline reply rendering.

use bson::{doc, Bson, Document};
use mongate_wire::{ErrorCode, WireError};
use thiserror::Error;

/// A single command failure as reported by a stage or backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            code_name: code.name().to_string(),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }
}

/// One failed item of a write batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    pub index: i32,
    pub code: i32,
    pub message: String,
}

/// Failure to satisfy the requested write concern.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
}

impl WriteConcernError {
    fn to_document(&self) -> Document {
        doc! {
            "code": self.code,
            "codeName": self.code_name.as_str(),
            "errmsg": self.message.as_str(),
        }
    }
}

/// Write errors plus an optional write concern error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteFailure {
    pub write_errors: Vec<WriteError>,
    pub write_concern_error: Option<WriteConcernError>,
    pub labels: Vec<String>,
}

impl WriteFailure {
    fn append_to(&self, out: &mut Document) {
        let errors: Vec<Bson> = self
            .write_errors
            .iter()
            .map(|e| {
                Bson::Document(doc! {
                    "code": e.code,
                    "errmsg": e.message.as_str(),
                    "index": e.index,
                })
            })
            .collect();
        out.insert("writeErrors", errors);
        if let Some(wce) = &self.write_concern_error {
            out.insert("writeConcernError", wce.to_document());
        }
        if !self.labels.is_empty() {
            out.insert("errorLabels", self.labels.clone());
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("command error {}({}): {}", .0.code_name, .0.code, .0.message)]
    Command(CommandError),

    #[error("write exception: {} write errors", .0.write_errors.len())]
    WriteException(WriteFailure),

    #[error("write concern error: {}", .0.message)]
    WriteConcern(WriteConcernError),

    #[error("bulk write exception: {} write errors", .0.write_errors.len())]
    BulkWrite(WriteFailure),

    #[error("operation was interrupted")]
    Cancelled,

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Shorthand for a single command error with a stable code.
    pub fn command(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerError::Command(CommandError::new(code, message))
    }

    /// Returns the closest stable error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Command(e) => {
                ErrorCode::from_code(e.code).unwrap_or(ErrorCode::InternalError)
            }
            ServerError::Cancelled => ErrorCode::Interrupted,
            ServerError::Bson(_) => ErrorCode::FailedToParse,
            _ => ErrorCode::InternalError,
        }
    }

    /// Returns whether the error comes from the byte stream itself.
    ///
    /// Such errors close the connection; everything else is answered inline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Io(_) | ServerError::Wire(_))
    }

    /// Renders the error as an inline reply document.
    pub fn to_document(&self) -> Document {
        match self {
            ServerError::Command(e) => {
                let mut out = doc! {
                    "ok": 0,
                    "errmsg": e.message.as_str(),
                    "code": e.code,
                    "codeName": e.code_name.as_str(),
                };
                if !e.labels.is_empty() {
                    out.insert("errorLabels", e.labels.clone());
                }
                out
            }
            ServerError::WriteException(failure) => {
                let mut out = doc! { "ok": 0, "n": 0 };
                failure.append_to(&mut out);
                out
            }
            ServerError::WriteConcern(wce) => doc! {
                "ok": 0,
                "writeConcernError": wce.to_document(),
            },
            // Partial success: the command itself succeeded.
            ServerError::BulkWrite(failure) => {
                let mut out = doc! { "ok": 1, "n": 0 };
                failure.append_to(&mut out);
                out
            }
            ServerError::Cancelled => ErrorCode::Interrupted.error_document(self.to_string()),
            ServerError::Bson(e) => ErrorCode::FailedToParse.error_document(e.to_string()),
            other => ErrorCode::InternalError.error_document(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
