//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("record too large: {size} bytes (max {max})")]
    LineTooLong { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in record")]
    InvalidUtf8,

    #[error("record is not a JSON object")]
    NotAnObject,
}
