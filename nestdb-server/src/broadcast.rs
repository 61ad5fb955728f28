//! Outbound event delivery.
//!
//! Every connection owns a bounded channel drained by its task. The hub maps
//! connection ids to the sending halves so a broadcast can push notifications
//! to subscribers without touching their sockets.

use dashmap::DashMap;
use nestdb_core::ConnectionId;
use nestdb_protocol::EventNotification;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Outcome of delivering one notification to a set of connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Notifications queued.
    pub delivered: usize,
    /// Targets whose queue was full.
    pub dropped: usize,
}

/// Routes event notifications to connection tasks.
#[derive(Debug, Default)]
pub struct EventHub {
    outbound: DashMap<ConnectionId, mpsc::Sender<EventNotification>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the outbound queue of a connection.
    pub fn register(&self, conn: ConnectionId, sender: mpsc::Sender<EventNotification>) {
        self.outbound.insert(conn, sender);
    }

    pub fn unregister(&self, conn: ConnectionId) {
        self.outbound.remove(&conn);
    }

    pub fn is_registered(&self, conn: ConnectionId) -> bool {
        self.outbound.contains_key(&conn)
    }

    /// Queues `note` for each target without waiting.
    ///
    /// Targets that are gone are skipped. A full queue drops the notification
    /// for that target only.
    pub fn deliver(&self, targets: &[ConnectionId], note: &EventNotification) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for conn in targets {
            let Some(sender) = self.outbound.get(conn) else {
                continue;
            };
            match sender.try_send(note.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Outbound queue full for connection {}, dropping event {}",
                        conn,
                        note.event
                    );
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Connection {} closed before event delivery", conn);
                }
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note(event: &str) -> EventNotification {
        EventNotification::new(json!(event), Some(json!(1)))
    }

    #[tokio::test]
    async fn test_deliver_to_registered() {
        let hub = EventHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register(2, tx_a);
        hub.register(3, tx_b);

        let report = hub.deliver(&[2, 3, 99], &note("room"));
        assert_eq!(report, DeliveryReport { delivered: 2, dropped: 0 });

        assert_eq!(rx_a.recv().await.unwrap().event, json!("room"));
        assert_eq!(rx_b.recv().await.unwrap().value, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_target() {
        let hub = EventHub::new();
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(4);
        hub.register(2, tx_slow);
        hub.register(3, tx_fast);

        hub.deliver(&[2, 3], &note("first"));
        let report = hub.deliver(&[2, 3], &note("second"));
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 1 });

        assert_eq!(rx_slow.recv().await.unwrap().event, json!("first"));
        assert!(rx_slow.try_recv().is_err());
        assert_eq!(rx_fast.recv().await.unwrap().event, json!("first"));
        assert_eq!(rx_fast.recv().await.unwrap().event, json!("second"));
    }

    #[test]
    fn test_unregister() {
        let hub = EventHub::new();
        let (tx, rx) = mpsc::channel(1);
        hub.register(7, tx);
        assert!(hub.is_registered(7));

        drop(rx);
        let report = hub.deliver(&[7], &note("gone"));
        assert_eq!(report.delivered, 0);

        hub.unregister(7);
        assert!(!hub.is_registered(7));
        assert!(hub.is_empty());
    }
}
