//! Event Broadcaster
//!
//! Best-effort fan-out into per-connection outbound channels. A slow or dead
//! connection never blocks the sender or the other recipients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::network::protocol::ServerMessage;
use crate::network::registry::ConnectionHandle;

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }
}

/// Fans server events out to connections.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    dropped: Arc<AtomicU64>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every recipient.
    pub fn publish(&self, recipients: &[ConnectionHandle], message: ServerMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for handle in recipients {
            if self.send(handle, message.clone()) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Deliver `message` to one connection.
    pub fn send(&self, handle: &ConnectionHandle, message: ServerMessage) -> bool {
        match handle.sender().try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Outbound buffer full for {} (player {}), dropped {:?}",
                    handle.conn_id(),
                    handle.player_id(),
                    message.session_id()
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Connection {} closed, event dropped", handle.conn_id());
                false
            }
        }
    }

    /// Events dropped since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::{tests::identity, ConnectionId};
    use tokio::sync::mpsc;

    fn handle(id: u64, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(ConnectionId(id), identity(id), tx), rx)
    }

    fn shutdown() -> ServerMessage {
        ServerMessage::Shutdown { reason: "test".into() }
    }

    #[tokio::test]
    async fn test_publish_to_all() {
        let broadcaster = EventBroadcaster::new();
        let (a, mut rx_a) = handle(1, 10);
        let (b, mut rx_b) = handle(2, 10);

        let report = broadcaster.publish(&[a, b], shutdown());

        assert_eq!(report, DeliveryReport { delivered: 2, failed: 0 });
        assert_eq!(rx_a.recv().await, Some(shutdown()));
        assert_eq!(rx_b.recv().await, Some(shutdown()));
    }

    #[tokio::test]
    async fn test_full_and_closed_do_not_block_others() {
        let broadcaster = EventBroadcaster::new();
        let (full, _rx_full) = handle(1, 1);
        let (closed, rx_closed) = handle(2, 10);
        let (ok, mut rx_ok) = handle(3, 10);
        drop(rx_closed);
        broadcaster.send(&full, shutdown());

        let report = broadcaster.publish(&[full, closed, ok], shutdown());

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.all_delivered());
        assert_eq!(broadcaster.dropped_total(), 2);
        assert!(rx_ok.recv().await.is_some());
    }
}
