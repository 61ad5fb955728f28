//! Per-connection event subscriptions.
//!
//! Subscriptions are indexed both by connection (so a closing connection can
//! be purged in one step) and by path (so a broadcast finds its targets
//! without scanning every connection). Paths match exactly, segment by
//! segment.

use crate::key::EventPath;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Identifier of a client connection.
pub type ConnectionId = u64;

#[derive(Debug, Default)]
pub struct EventRegistry {
    by_connection: HashMap<ConnectionId, HashSet<EventPath>>,
    by_path: HashMap<EventPath, BTreeSet<ConnectionId>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `conn` to `path`. Returns false if it already was.
    pub fn subscribe(&mut self, conn: ConnectionId, path: EventPath) -> bool {
        let added = self
            .by_connection
            .entry(conn)
            .or_default()
            .insert(path.clone());
        if added {
            self.by_path.entry(path).or_default().insert(conn);
        }
        added
    }

    pub fn is_subscribed(&self, conn: ConnectionId, path: &EventPath) -> bool {
        self.by_connection
            .get(&conn)
            .is_some_and(|paths| paths.contains(path))
    }

    /// Returns whether any connection subscribes to `path`.
    pub fn any_subscribed(&self, path: &EventPath) -> bool {
        self.by_path.get(path).is_some_and(|conns| !conns.is_empty())
    }

    /// Removes one subscription, or every subscription of `conn` when `path`
    /// is `None`. Returns the number removed.
    pub fn unsubscribe(&mut self, conn: ConnectionId, path: Option<&EventPath>) -> usize {
        let Some(path) = path else {
            return self.purge(conn);
        };
        let Some(paths) = self.by_connection.get_mut(&conn) else {
            return 0;
        };
        if !paths.remove(path) {
            return 0;
        }
        if paths.is_empty() {
            self.by_connection.remove(&conn);
        }
        self.detach(conn, path);
        1
    }

    /// Drops every subscription held by `conn`.
    pub fn purge(&mut self, conn: ConnectionId) -> usize {
        let Some(paths) = self.by_connection.remove(&conn) else {
            return 0;
        };
        for path in &paths {
            self.detach(conn, path);
        }
        paths.len()
    }

    /// Connections subscribed to `path`, in ascending id order.
    pub fn subscribers_of(&self, path: &EventPath) -> Vec<ConnectionId> {
        self.by_path
            .get(path)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriptions_of(&self, conn: ConnectionId) -> Vec<EventPath> {
        let mut paths: Vec<EventPath> = self
            .by_connection
            .get(&conn)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// Total number of (connection, path) pairs.
    pub fn subscription_count(&self) -> usize {
        self.by_connection.values().map(HashSet::len).sum()
    }

    /// Number of connections holding at least one subscription.
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    fn detach(&mut self, conn: ConnectionId, path: &EventPath) {
        if let Some(conns) = self.by_path.get_mut(path) {
            conns.remove(&conn);
            if conns.is_empty() {
                self.by_path.remove(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> EventPath {
        EventPath::parse(s)
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut registry = EventRegistry::new();
        assert!(registry.subscribe(1, path("alerts")));
        assert!(!registry.subscribe(1, path("alerts")));
        assert_eq!(registry.subscription_count(), 1);
        assert!(registry.is_subscribed(1, &path("alerts")));
        assert!(registry.any_subscribed(&path("alerts")));
    }

    #[test]
    fn test_exact_matching() {
        let mut registry = EventRegistry::new();
        registry.subscribe(1, path("a"));
        registry.subscribe(2, path("a.b"));

        assert_eq!(registry.subscribers_of(&path("a")), vec![1]);
        assert_eq!(registry.subscribers_of(&path("a.b")), vec![2]);
        assert!(registry.subscribers_of(&path("a.b.c")).is_empty());
    }

    #[test]
    fn test_unsubscribe_one_and_all() {
        let mut registry = EventRegistry::new();
        registry.subscribe(1, path("x"));
        registry.subscribe(1, path("y"));
        registry.subscribe(2, path("x"));

        assert_eq!(registry.unsubscribe(1, Some(&path("x"))), 1);
        assert_eq!(registry.unsubscribe(1, Some(&path("x"))), 0);
        assert_eq!(registry.subscribers_of(&path("x")), vec![2]);

        assert_eq!(registry.unsubscribe(1, None), 1);
        assert!(registry.subscriptions_of(1).is_empty());
        assert!(!registry.any_subscribed(&path("y")));
    }

    #[test]
    fn test_purge_clears_both_indexes() {
        let mut registry = EventRegistry::new();
        registry.subscribe(7, path("a"));
        registry.subscribe(7, path("b"));
        registry.subscribe(8, path("a"));

        assert_eq!(registry.purge(7), 2);
        assert_eq!(registry.purge(7), 0);
        assert_eq!(registry.subscribers_of(&path("a")), vec![8]);
        assert!(!registry.any_subscribed(&path("b")));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_subscribers_sorted() {
        let mut registry = EventRegistry::new();
        for conn in [5, 3, 9] {
            registry.subscribe(conn, path("topic"));
        }
        assert_eq!(registry.subscribers_of(&path("topic")), vec![3, 5, 9]);
        assert_eq!(registry.subscriptions_of(5), vec![path("topic")]);
    }
}
