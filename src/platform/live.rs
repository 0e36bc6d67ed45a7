use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Outgoing message pushed to live webchat sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEvent {
    pub conversation_id: String,
    pub message_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// In-process fan-out of outgoing webchat messages, keyed by conversation.
/// Publishing is best-effort: no subscriber, no delivery, no error.
pub struct LiveSessionHub {
    channels: RwLock<HashMap<String, broadcast::Sender<LiveEvent>>>,
}

impl LiveSessionHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<LiveEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    /// Returns the number of live receivers the event reached.
    pub async fn publish(&self, event: LiveEvent) -> usize {
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(&event.conversation_id) {
                Some(sender) => sender.send(event.clone()).unwrap_or(0),
                None => 0,
            }
        };
        debug!(
            conversation_id = %event.conversation_id,
            delivered,
            "live event published"
        );
        delivered
    }

    /// Drop channels that lost all their subscribers.
    pub async fn prune(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for LiveSessionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(conversation_id: &str, text: &str) -> LiveEvent {
        LiveEvent {
            conversation_id: conversation_id.to_string(),
            message_id: "m1".to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = LiveSessionHub::new();
        let mut rx = hub.subscribe("C1").await;
        assert_eq!(hub.publish(event("C1", "Hi!")).await, 1);
        assert_eq!(rx.recv().await.unwrap().text, "Hi!");
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_silent() {
        let hub = LiveSessionHub::new();
        assert_eq!(hub.publish(event("C1", "Hi!")).await, 0);
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = LiveSessionHub::new();
        drop(hub.subscribe("C1").await);
        hub.prune().await;
        assert_eq!(hub.publish(event("C1", "Hi!")).await, 0);
    }
}
