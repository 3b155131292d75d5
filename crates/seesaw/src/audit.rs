//! Debug-only event auditing: logs every envelope that crosses a bus so a
//! developer can see machine reactions without wiring a dedicated
//! [`crate::EventTap`]. Compiled only with `debug_assertions` — never part
//! of a release build.

use tracing::debug;

use crate::core::{Event, EventEnvelope};
use crate::bus::EventBus;

/// Spawns a task that logs every event on `bus` at `debug` level until the
/// bus's last sender is dropped. Intended for local development; the
/// returned handle can be aborted early if needed.
pub fn spawn_audit_log<E>(bus: &EventBus<E>) -> tokio::task::JoinHandle<()>
where
    E: Event + Clone,
{
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => log_envelope(&envelope),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "audit log lagged behind event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_envelope<E: Event>(envelope: &EventEnvelope<E>) {
    debug!(
        event = ?envelope.event,
        role = ?envelope.role,
        correlation_id = ?envelope.correlation_id,
        emitted_at = %envelope.emitted_at,
        "event observed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping;

    #[tokio::test]
    async fn audit_log_task_does_not_panic_on_lagged_receiver() {
        let bus: EventBus<Ping> = EventBus::with_capacity(2);
        let handle = spawn_audit_log(&bus);

        for _ in 0..10 {
            bus.emit(Ping);
        }
        tokio::task::yield_now().await;

        handle.abort();
    }
}
