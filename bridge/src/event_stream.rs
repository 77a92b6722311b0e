// Pass-through update streaming
//
// Updates the dispatcher does not consume are fanned out to SSE clients
// over a tokio broadcast channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Update forwarded to SSE subscribers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Timestamp (RFC 3339)
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl UpdateEvent {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: kind.into(),
            data,
        }
    }
}

#[derive(Clone)]
pub struct UpdateBroadcaster {
    sender: broadcast::Sender<UpdateEvent>,
}

impl UpdateBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers reached
    pub fn broadcast(&self, event: UpdateEvent) -> usize {
        // no subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UpdateBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
