//! Broadcast event bus for distributing `JobEvent` to in-process subscribers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.
//! [`EventBus::emit`] additionally forwards the event through the state
//! contract so other worker processes see it.

use stagehand_types::event::JobEvent;
use tokio::sync::broadcast;

use crate::state::BoxStateContract;

/// Multi-consumer event bus for job progress events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current in-process subscribers.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish in-process and through the state contract.
    ///
    /// Contract failures are logged and swallowed: progress notification is
    /// best-effort and never affects scheduling.
    pub async fn emit(&self, state: &BoxStateContract, event: JobEvent) {
        let job_id = event.job_id();
        let event_type = event.event_type();
        match serde_json::to_value(&event) {
            Ok(data) => {
                if let Err(e) = state.publish_event(&job_id, event_type, &data).await {
                    tracing::debug!(%job_id, event_type, error = %e, "failed to publish event");
                }
            }
            Err(e) => {
                tracing::debug!(%job_id, event_type, error = %e, "failed to serialize event");
            }
        }
        self.publish(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
