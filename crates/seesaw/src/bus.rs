//! In-memory event distribution.
//!
//! At-most-once delivery: slow subscribers can lag and miss events. The bus
//! is not a durability mechanism — use the job queue ([`crate::job`]) when a
//! fact must survive a process restart.

use tokio::sync::broadcast;

use crate::core::{CorrelationId, EventEnvelope, Event};

const DEFAULT_CAPACITY: usize = 1024;

/// Cloneable handle to an in-memory event bus. Cloning shares the same
/// underlying channel; every clone can `emit` and `subscribe`.
pub struct EventBus<E> {
    sender: broadcast::Sender<EventEnvelope<E>>,
}

impl<E: Event + Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Returns the number of
    /// receivers that were live at publish time (0 is not an error — it
    /// just means nobody is listening right now).
    pub fn emit(&self, event: E) -> usize {
        self.emit_envelope(EventEnvelope::new(event))
    }

    pub fn emit_correlated(&self, event: E, correlation_id: CorrelationId) -> usize {
        self.emit_envelope(EventEnvelope::new(event).with_correlation(correlation_id))
    }

    fn emit_envelope(&self, envelope: EventEnvelope<E>) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<E>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Event + Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Event + Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
