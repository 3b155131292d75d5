//! Batteries-included wrapper over [`crate::Runtime`]: spawns the run loop
//! and hands back a cloneable [`EngineHandle`] with `emit`/`emit_and_await`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::EventBus;
use crate::core::{Command, Event};
use crate::dispatch::JobQueue;
use crate::effect_impl::Effect;
use crate::error::SeesawError;
use crate::machine::Machine;
use crate::runtime::RuntimeBuilder;

const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Counts commands currently being dispatched so [`EngineHandle::emit_and_await`]
/// knows when a burst of reactions has fully settled.
#[derive(Clone, Default)]
pub struct InflightTracker {
    inner: Arc<InflightInner>,
}

#[derive(Default)]
struct InflightInner {
    count: AtomicI64,
    notify: tokio::sync::Notify,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of one in-flight dispatch; the guard decrements and
    /// wakes waiters when dropped.
    pub fn track(&self) -> InflightBatch {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InflightBatch {
            inner: self.inner.clone(),
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.inner.count.load(Ordering::SeqCst) <= 0
    }

    /// Waits until no dispatch is in flight, polling the notifier each time
    /// it wakes (a new command may have started between notification and
    /// the check).
    pub async fn wait_quiescent(&self) {
        loop {
            if self.is_quiescent() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

/// RAII guard for one in-flight dispatch; see [`InflightTracker::track`].
pub struct InflightBatch {
    inner: Arc<InflightInner>,
}

impl Drop for InflightBatch {
    fn drop(&mut self) {
        self.inner.count.fetch_sub(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

/// A running engine: the run loop task plus the bus and inflight tracker
/// needed to build handles.
pub struct Engine<E: Event + Clone> {
    bus: EventBus<E>,
    inflight: InflightTracker,
    task: JoinHandle<()>,
}

impl<E: Event + Clone> Engine<E> {
    /// Returns a cloneable handle for emitting events into the engine.
    pub fn handle(&self) -> EngineHandle<E> {
        EngineHandle {
            bus: self.bus.clone(),
            inflight: self.inflight.clone(),
        }
    }

    /// Aborts the run loop task. Any in-flight dispatch is left to finish
    /// or be dropped by the runtime.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Cloneable front door to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle<E: Event + Clone> {
    bus: EventBus<E>,
    inflight: InflightTracker,
}

impl<E: Event + Clone> EngineHandle<E> {
    pub fn emit(&self, event: E) -> usize {
        self.bus.emit(event)
    }

    /// Emits `event` and waits for every machine reaction it (transitively)
    /// causes to finish dispatching, up to 30s. Use when a caller needs the
    /// side effects of an event to be visible before proceeding (tests,
    /// CLI demos) rather than fire-and-forget.
    pub async fn emit_and_await(&self, event: E) -> Result<(), SeesawError> {
        self.emit_and_await_timeout(event, DEFAULT_QUIESCE_TIMEOUT).await
    }

    pub async fn emit_and_await_timeout(
        &self,
        event: E,
        wait: Duration,
    ) -> Result<(), SeesawError> {
        self.bus.emit(event);
        // Give the runtime task a chance to observe the event and start
        // dispatching before we check quiescence.
        tokio::task::yield_now().await;
        timeout(wait, self.inflight.wait_quiescent())
            .await
            .map_err(|_| SeesawError::Timeout(wait))
    }
}

/// Builds an [`Engine`] from machines and effects, the same way
/// [`RuntimeBuilder`] does, then spawns the run loop for you.
pub struct EngineBuilder<E, C, D>
where
    E: Event + Clone,
    C: Command,
    D: Send + Sync + 'static,
{
    inner: RuntimeBuilder<E, C, D>,
    inflight: InflightTracker,
}

impl<E, C, D> EngineBuilder<E, C, D>
where
    E: Event + Clone,
    C: Command,
    D: Send + Sync + 'static,
{
    pub fn new(deps: D) -> Self {
        Self {
            inner: RuntimeBuilder::new(deps),
            inflight: InflightTracker::new(),
        }
    }

    pub fn with_job_queue(mut self, job_queue: Arc<dyn JobQueue>) -> Self {
        self.inner = self.inner.with_job_queue(job_queue);
        self
    }

    pub fn with_machine<M>(mut self, machine: M) -> Self
    where
        M: Machine<Event = E, Command = C>,
    {
        self.inner = self.inner.with_machine(machine);
        self
    }

    pub fn with_effect<C2, Ef>(mut self, effect: Ef) -> Self
    where
        C2: Command,
        Ef: Effect<C2, D, Event = E>,
    {
        self.inner = self.inner.with_effect(effect);
        self
    }

    /// Builds the runtime and immediately spawns its run loop.
    pub fn start(self) -> Engine<E> {
        let (runtime, bus) = self.inner.build();
        let inflight = self.inflight;
        let instrumented = crate::runtime::instrumented_run(runtime, inflight.clone());
        let task = tokio::spawn(instrumented);
        Engine { bus, inflight, task }
    }
}
