//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] nestdb_protocol::ProtocolError),

    #[error("{0}")]
    Core(#[from] nestdb_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot process command before init handshake")]
    NotAuthenticated,

    #[error("invalid secret supplied to init")]
    AuthFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("exception at run(): {0}")]
    Script(#[source] nestdb_core::CoreError),

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Returns a short label for this error, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "io",
            ServerError::Protocol(_) => "protocol",
            ServerError::Core(_) => "store",
            ServerError::Json(_) => "json",
            ServerError::NotAuthenticated => "not_authenticated",
            ServerError::AuthFailed => "auth_failed",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Script(_) => "script",
            ServerError::HandlerPanic(_) => "panic",
            ServerError::ShuttingDown => "shutting_down",
            ServerError::Config(_) => "config",
            ServerError::Metrics(_) => "metrics",
        }
    }

    /// Returns the text placed in a response's `error` field.
    ///
    /// Auth and script errors are reported verbatim; everything else raised
    /// while handling a command is prefixed.
    pub fn response_message(&self) -> String {
        match self {
            ServerError::NotAuthenticated | ServerError::AuthFailed | ServerError::Script(_) => {
                self.to_string()
            }
            other => format!("failed to process command: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestdb_core::CoreError;

    #[test]
    fn test_response_messages() {
        assert_eq!(
            ServerError::NotAuthenticated.response_message(),
            "cannot process command before init handshake"
        );
        assert_eq!(
            ServerError::AuthFailed.response_message(),
            "invalid secret supplied to init"
        );

        let script = ServerError::Script(CoreError::ScriptRuntime {
            reason: "division by zero".to_string(),
        });
        assert_eq!(
            script.response_message(),
            "exception at run(): script error: division by zero"
        );

        let handler = ServerError::InvalidRequest("missing field `key`".to_string());
        assert_eq!(
            handler.response_message(),
            "failed to process command: invalid request: missing field `key`"
        );
    }

    #[test]
    fn test_script_error_source() {
        use std::error::Error;
        let err = ServerError::Script(CoreError::ScriptSyntax {
            position: 3,
            reason: "expected ')'".to_string(),
        });
        assert!(err.source().is_some());
        assert_eq!(err.kind(), "script");
    }
}
