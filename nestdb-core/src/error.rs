//! Core error types.

use thiserror::Error;

/// Errors from the store, expiry index and script engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("value at '{key}' is not a number")]
    NotANumber { key: String },

    #[error("value at '{key}' is not a sequence")]
    NotASequence { key: String },

    #[error("index {index} out of range at '{key}'")]
    IndexOutOfRange { key: String, index: usize },

    #[error("script syntax error at offset {position}: {reason}")]
    ScriptSyntax { position: usize, reason: String },

    #[error("script error: {reason}")]
    ScriptRuntime { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn invalid_key(reason: impl Into<String>) -> Self {
        CoreError::InvalidKey {
            reason: reason.into(),
        }
    }

    pub(crate) fn runtime(reason: impl Into<String>) -> Self {
        CoreError::ScriptRuntime {
            reason: reason.into(),
        }
    }

    /// Returns whether this error was raised by the script engine itself.
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            CoreError::ScriptSyntax { .. } | CoreError::ScriptRuntime { .. }
        )
    }

    /// Returns a stable label for this error, used in logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidKey { .. } => "INVALID_KEY",
            CoreError::NotANumber { .. } => "NOT_A_NUMBER",
            CoreError::NotASequence { .. } => "NOT_A_SEQUENCE",
            CoreError::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            CoreError::ScriptSyntax { .. } => "SCRIPT_SYNTAX",
            CoreError::ScriptRuntime { .. } => "SCRIPT_RUNTIME",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}
