//! Application-wide change notifications.
//!
//! Notifications carry no payload beyond "something changed"; subscribers
//! re-read the state they care about.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    AgentsChanged,
    ProvidersUpdated,
    /// Models of one provider, or of all providers when `None`.
    ModelsUpdated { provider_id: Option<String> },
    SessionsChanged,
}

/// Broadcast bus for [`AppEvent`]s.
///
/// Clone this to share it; every clone publishes to the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AppEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
