//! Watch-event delivery between the repository and the lifecycle handler.
//!
//! Delivery is at-least-once with no ordering guarantee across objects; the
//! lifecycle handler is written to be safe under redelivery, so subscribers
//! always re-read the current object rather than trusting the event payload.

use crate::models::now_rfc3339;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// A pipeline execution was created or updated.
    AppliedExecution { namespace: String, name: String },
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub kind: Kind,
    pub emitted: String,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { sender }
    }

    /// Publish an event to all current subscribers. Publishing with no
    /// subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, kind: Kind) {
        let event = Event {
            id: Uuid::now_v7().to_string(),
            kind,
            emitted: now_rfc3339(),
        };
        _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
