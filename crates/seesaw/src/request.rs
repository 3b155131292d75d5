//! Syntactic sugar over the event bus for request/reply style call sites
//! (emit a fact, wait for the correlated reply) without hand-rolling a
//! subscribe-loop at every call site.

use std::time::Duration;

use tokio::time::timeout;

use crate::core::{CorrelationId, EnvelopeMatch, Event, EventEnvelope};
use crate::error::SeesawError;
use crate::EventBus;

/// Default time to wait for a correlated reply before giving up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Emit `event` with a fresh correlation id and wait for the first event on
/// `bus` for which `matcher` returns true, up to [`DEFAULT_REQUEST_TIMEOUT`].
pub async fn dispatch_request<E, M>(
    bus: &EventBus<E>,
    event: E,
    matcher: M,
) -> Result<E, SeesawError>
where
    E: Event + Clone,
    M: EnvelopeMatch<E>,
{
    dispatch_request_timeout(bus, event, matcher, DEFAULT_REQUEST_TIMEOUT).await
}

/// Like [`dispatch_request`] with an explicit timeout.
pub async fn dispatch_request_timeout<E, M>(
    bus: &EventBus<E>,
    event: E,
    matcher: M,
    wait: Duration,
) -> Result<E, SeesawError>
where
    E: Event + Clone,
    M: EnvelopeMatch<E>,
{
    let correlation_id = CorrelationId::new();
    let mut receiver = bus.subscribe();
    bus.emit_correlated(event, correlation_id);

    let wait_for_reply = async {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if matches_request(&envelope, &matcher) {
                        return Ok(envelope.event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(SeesawError::ShuttingDown)
                }
            }
        }
    };

    match timeout(wait, wait_for_reply).await {
        Ok(result) => result,
        Err(_) => Err(SeesawError::Timeout(wait)),
    }
}

fn matches_request<E, M: EnvelopeMatch<E>>(envelope: &EventEnvelope<E>, matcher: &M) -> bool {
    matcher.matches(envelope)
}
