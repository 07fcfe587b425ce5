use tokio::sync::broadcast;
use weaver_types::Event;

/// Typed publish-subscribe fan-out (spec.md §4.11). Producers never block on
/// subscribers: `publish` ignores send errors, and a dropped receiver simply stops
/// receiving rather than backing up the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::new("feature-started", json!({"featureId": "f1"})));
        let received = rx.recv().await.expect("event delivered");
        assert_eq!(received.event_type, "feature-started");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::new("feature-started", json!({})));
    }
}
