//! Same-process broadcast of raw update records

use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

/// A record fanned out to every participant sharing the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    /// Storage key the record belongs to
    pub key: String,
    /// Participant that published the record
    pub sender: String,
    /// Serialized update record
    pub payload: String,
}

/// Broadcast channel shared by co-located participants
///
/// Publishers receive their own messages too; receivers filter on
/// [`BroadcastMessage::sender`].
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a record. Returns the number of receivers it reached.
    pub fn publish(&self, message: BroadcastMessage) -> usize {
        let key = message.key.clone();
        let reached = self.tx.send(message).unwrap_or(0);
        trace!(key = %key, reached, "Broadcast update");
        reached
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str) -> BroadcastMessage {
        BroadcastMessage {
            key: "k".into(),
            sender: sender.into(),
            payload: "{}".into(),
        }
    }

    #[tokio::test]
    async fn test_fan_out() {
        let hub = BroadcastHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.clone().subscribe();

        assert_eq!(hub.publish(message("s1")), 2);
        assert_eq!(a.recv().await.unwrap().sender, "s1");
        assert_eq!(b.recv().await.unwrap(), message("s1"));
    }

    #[test]
    fn test_publish_without_receivers() {
        let hub = BroadcastHub::new(4);
        assert_eq!(hub.publish(message("s1")), 0);
        assert_eq!(hub.receiver_count(), 0);
    }
}
