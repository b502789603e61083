use tokio::sync::broadcast;

use crate::types::FlowEvent;

/// Default capacity. Streaming runs publish one `NodeChunk` per token for
/// every running node, so this is sized well above the status traffic.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Fan-out of run progress to every subscriber.
///
/// Publishing never blocks the executor. A subscriber that falls more than
/// the capacity behind gets `RecvError::Lagged` and resumes from the oldest
/// retained event.
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
