use crate::types::RunEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events of all runs.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, RunId};

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(RunEvent {
            run_id: RunId::from_str("r1"),
            node_id: Some("n1".into()),
            event_type: EventType::NodeStarted,
            payload: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
            sequence: 1,
        });

        assert_eq!(a.recv().await.unwrap().sequence, 1);
        assert_eq!(b.recv().await.unwrap().event_type, EventType::NodeStarted);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(RunEvent {
            run_id: RunId::new(),
            node_id: None,
            event_type: EventType::RunStarted,
            payload: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
            sequence: 0,
        });
    }
}
