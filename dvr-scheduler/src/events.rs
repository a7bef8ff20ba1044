//! Broadcast plumbing shared by the store and the schedule manager.

use tokio::sync::broadcast;

/// Default capacity for event channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out of events to any number of subscribers.
///
/// Slow subscribers observe `RecvError::Lagged` and must resynchronise from
/// the source of truth.
#[derive(Debug, Clone)]
pub struct EventBroadcaster<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBroadcaster<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers that got it.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBroadcaster<E> {
    fn default() -> Self {
        Self::new()
    }
}
