//! Lifecycle records for a supervising process.
//!
//! The server reports `{"event":"listening"}` once it is bound and
//! `{"event":"error","data":{"message":..,"stack":..}}` on fatal errors and
//! connection task panics. Records are JSON lines on stdout.

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// A record sent to the supervising process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SupervisorEvent {
    Listening,
    Error { data: ErrorReport },
}

/// Details of a reported error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    /// The error followed by its chain of causes, one per line.
    pub stack: String,
}

impl SupervisorEvent {
    /// Builds an error record, walking the error's source chain.
    pub fn error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push_str("\n  caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        SupervisorEvent::Error {
            data: ErrorReport {
                message: err.to_string(),
                stack,
            },
        }
    }

    /// Builds an error record for a panic.
    pub fn panic(message: impl Into<String>) -> Self {
        let message = message.into();
        SupervisorEvent::Error {
            data: ErrorReport {
                stack: format!("panicked: {}", message),
                message,
            },
        }
    }

    /// Encodes the record as a single JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Handle used by server components to report to the supervisor.
///
/// A detached supervisor drops everything it is given.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    tx: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl Supervisor {
    /// Creates a supervisor handle and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn report(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("Supervisor channel closed, dropping event");
            }
        }
    }
}

/// Writes supervisor events to stdout until every sender is dropped.
pub async fn forward_to_stdout(mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode supervisor event: {}", e);
                continue;
            }
        };
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            tracing::error!("Failed to write supervisor event: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::error::ServerError;
    use serde_json::json;

    #[test]
    fn test_listening_record() {
        assert_eq!(
            SupervisorEvent::Listening.to_line().unwrap(),
            "{\"event\":\"listening\"}\n"
        );
    }

    #[test]
    fn test_error_record_includes_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ServerError::Config(ConfigError::IoError("nestdb.yaml".into(), io));
        let event = SupervisorEvent::error(&err);

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "error");
        let message = value["data"]["message"].as_str().unwrap();
        assert!(message.contains("nestdb.yaml"));
        let stack = value["data"]["stack"].as_str().unwrap();
        assert!(stack.starts_with(message));
        assert!(stack.contains("caused by: no such file"));
    }

    #[test]
    fn test_panic_record() {
        let event = SupervisorEvent::panic("boom");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "error", "data": {"message": "boom", "stack": "panicked: boom"}})
        );
    }

    #[tokio::test]
    async fn test_channel() {
        let (supervisor, mut rx) = Supervisor::channel();
        supervisor.report(SupervisorEvent::Listening);
        assert_eq!(rx.recv().await, Some(SupervisorEvent::Listening));

        drop(supervisor);
        assert_eq!(rx.recv().await, None);

        // Reporting to a detached supervisor is a no-op.
        Supervisor::detached().report(SupervisorEvent::Listening);
    }
}
