//! Connection registry.

use crate::auth::SecretValidator;
use dashmap::DashMap;
use nestdb_core::ConnectionId;

/// Authentication state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Waiting for a successful `init`.
    Pending,
    /// `init` succeeded.
    Active,
}

/// What the server knows about an open connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub state: AuthState,
    /// Script run once when the connection closes.
    pub death_query: Option<String>,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self {
            state: AuthState::Pending,
            death_query: None,
        }
    }
}

/// Tracks open connections by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new connection in the `Pending` state.
    pub fn on_connect(&self, conn: ConnectionId) {
        self.connections.insert(conn, ConnectionRecord::new());
    }

    /// Validates `supplied` and activates the connection on success.
    ///
    /// Re-authenticating an active connection succeeds without changing it.
    pub fn authenticate(
        &self,
        conn: ConnectionId,
        supplied: Option<&str>,
        validator: &SecretValidator,
    ) -> bool {
        if !validator.validate(supplied) {
            return false;
        }
        if let Some(mut record) = self.connections.get_mut(&conn) {
            record.state = AuthState::Active;
        }
        true
    }

    /// Stores the death query of `conn`. Does nothing for unknown connections.
    pub fn set_death_query(&self, conn: ConnectionId, script: String) -> bool {
        match self.connections.get_mut(&conn) {
            Some(mut record) => {
                record.death_query = Some(script);
                true
            }
            None => false,
        }
    }

    /// Forgets `conn`, returning its record.
    pub fn remove(&self, conn: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.remove(&conn).map(|(_, record)| record)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    pub fn state(&self, conn: ConnectionId) -> Option<AuthState> {
        self.connections.get(&conn).map(|record| record.state)
    }

    pub fn is_active(&self, conn: ConnectionId) -> bool {
        self.state(conn) == Some(AuthState::Active)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
