//! Observation hooks for events flowing through the bus, used by debug
//! auditing ([`crate::audit`]) and tests that assert on emitted events
//! without wiring a full subscriber.

use async_trait::async_trait;

use crate::core::{Event, EventEnvelope};

/// Context handed to a tap alongside the observed event.
pub struct TapContext {
    pub subscriber_count: usize,
}

/// A passive observer of every event emitted on a bus. Taps never produce
/// commands; for that, use a [`crate::Machine`].
#[async_trait]
pub trait EventTap<E: Event>: Send + Sync + 'static {
    async fn observe(&self, envelope: &EventEnvelope<E>, ctx: &TapContext);
}

#[async_trait]
impl<E, F> EventTap<E> for F
where
    E: Event,
    F: Fn(&EventEnvelope<E>) + Send + Sync + 'static,
{
    async fn observe(&self, envelope: &EventEnvelope<E>, _ctx: &TapContext) {
        (self)(envelope)
    }
}
