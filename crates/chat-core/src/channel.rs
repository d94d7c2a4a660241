use tokio::sync::broadcast;

use crate::types::{OperationFailure, SessionEvent};

/// Receiver handed to session subscribers. Dropping it unsubscribes.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Fan-out of session notifications to any number of subscribers.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    /// Create a channel whose subscribers buffer up to `event_buffer` events.
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to future notifications.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Signal that the snapshot changed.
    pub fn notify_changed(&self) {
        self.emit(SessionEvent::Changed);
    }

    /// Report a recoverable failure.
    pub fn notify_failed(&self, failure: OperationFailure) {
        self.emit(SessionEvent::OperationFailed(failure));
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; having no subscribers is not an error, and
    /// lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}
