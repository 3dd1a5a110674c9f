//! Event publication for the UI layer.
//!
//! Status messages and node changes go out on a broadcast channel. Every
//! status message is also logged at the level its category implies.

use nodegate_core::{NodeStatus, ServerEvent, StatusCategory, StatusMessage};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events buffered per slow reader before it starts missing some.
const EVENT_CAPACITY: usize = 256;

/// Cloneable publisher shared by every listener.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish and log a status message.
    pub fn status(&self, text: impl Into<String>, category: StatusCategory) {
        let message = StatusMessage::new(text, category);
        match category {
            StatusCategory::Debug => debug!(%category, "{}", message.text),
            StatusCategory::Warning => warn!(%category, "{}", message.text),
            StatusCategory::Error => error!(%category, "{}", message.text),
            _ => info!(%category, "{}", message.text),
        }
        // No subscribers is fine.
        let _ = self.tx.send(ServerEvent::Status(message));
    }

    /// Publish a node occupancy change.
    pub fn node(&self, status: NodeStatus) {
        debug!(
            node = status.number,
            in_use = status.in_use,
            status = %status.status,
            "node changed"
        );
        let _ = self.tx.send(ServerEvent::Node(status));
    }
}
