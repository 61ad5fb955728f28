//! Connection id allocation.

use nestdb_core::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound of the id counter. Ids lie in `[1, MAX_CONNECTION_ID)`.
pub const MAX_CONNECTION_ID: u64 = (1 << 53) - 2;

/// Hands out increasing connection ids, wrapping back to 1.
///
/// Ids never take the value 0, so a zero id can be treated as absent.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    counter: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self::with_counter(1)
    }

    /// Starts the counter at `counter`; the next id is its successor.
    pub fn with_counter(counter: u64) -> Self {
        Self {
            counter: AtomicU64::new(counter),
        }
    }

    /// Returns the next id.
    pub fn allocate(&self) -> ConnectionId {
        let previous = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(Self::successor(current))
            })
            .unwrap_or_else(|current| current);
        Self::successor(previous)
    }

    /// Returns the next id for which `in_use` is false.
    pub fn allocate_unused(&self, in_use: impl Fn(ConnectionId) -> bool) -> ConnectionId {
        loop {
            let id = self.allocate();
            if !in_use(id) {
                return id;
            }
            tracing::debug!("Connection id {} still in use, skipping", id);
        }
    }

    fn successor(current: u64) -> u64 {
        let next = current.saturating_add(1);
        if next >= MAX_CONNECTION_ID {
            1
        } else {
            next
        }
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
