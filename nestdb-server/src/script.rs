//! Script execution for `run` and death queries.

use nestdb_core::{ConnectionId, CoreError, Database, KeyPath, Script};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// Parses and runs scripts against a locked database.
pub struct ScriptRunner;

impl ScriptRunner {
    /// Runs `source` with the store rebased to `base`.
    ///
    /// Mutations made before a failure are kept.
    pub fn run(
        db: &mut Database,
        source: &str,
        base: Option<KeyPath>,
    ) -> Result<Option<Value>, CoreError> {
        let started = Instant::now();
        let script = Script::parse(source)?;
        let result = db.run_script(&script, base);
        tracing::trace!(
            "Script finished in {:?} (ok={})",
            started.elapsed(),
            result.is_ok()
        );
        result
    }

    /// Runs the death query of a closed connection.
    ///
    /// The result is discarded and failures, panics included, are only
    /// logged.
    pub fn run_death_query(db: &mut Database, conn: ConnectionId, source: &str) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| Self::run(db, source, None)));
        match outcome {
            Ok(Ok(_)) => tracing::debug!("Death query for connection {} completed", conn),
            Ok(Err(e)) => tracing::warn!("Death query for connection {} failed: {}", conn, e),
            Err(payload) => tracing::error!(
                "Death query for connection {} panicked: {}",
                conn,
                panic_message(payload.as_ref())
            ),
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
