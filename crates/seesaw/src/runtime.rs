//! Wires machines, effects and the bus together into a single run loop.
//!
//! `Runtime` is the low-level building block: construct it, `spawn` its
//! `run()` future yourself, and keep the returned [`EventBus`] to `emit`
//! into it. [`crate::Engine`] wraps this with a nicer `start()`/handle API
//! for the common case.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Command, Event};
use crate::dispatch::{Dispatcher, JobQueue, NoOpJobQueue};
use crate::machine::Machine;
use crate::effect_impl::{Effect, EffectContext};
use crate::bus::EventBus;

/// A running coordination loop for one `(Event, Command)` pair: every event
/// emitted on `bus` is offered to each registered machine; any command a
/// machine decides on is routed through the dispatcher.
pub struct Runtime<E, C, D>
where
    E: Event + Clone,
    C: Command,
{
    bus: EventBus<E>,
    machines: Vec<Box<dyn Machine<Event = E, Command = C>>>,
    dispatcher: Arc<Dispatcher<D>>,
}

impl<E, C, D> Runtime<E, C, D>
where
    E: Event + Clone,
    C: Command,
    D: Send + Sync + 'static,
{
    /// Consumes the runtime, subscribing to its bus and driving machines
    /// until the bus is dropped (all senders gone) or the task is aborted.
    pub async fn run(mut self) {
        let mut receiver = self.bus.subscribe();
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    for machine in self.machines.iter_mut() {
                        if let Some(cmd) = machine.decide(&envelope.event) {
                            if let Err(err) = self.dispatcher.dispatch(cmd).await {
                                warn!(error = %err, "command dispatch failed");
                            }
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "runtime lagged behind event bus, events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("event bus closed, runtime stopping");
                    break;
                }
            }
        }
    }
}

/// Builds a [`Runtime`] and its paired [`EventBus`].
pub struct RuntimeBuilder<E, C, D>
where
    E: Event + Clone,
    C: Command,
    D: Send + Sync + 'static,
{
    deps: Arc<D>,
    bus: EventBus<E>,
    machines: Vec<Box<dyn Machine<Event = E, Command = C>>>,
    job_queue: Arc<dyn JobQueue>,
    inline: Vec<Box<dyn FnOnce(&mut Dispatcher<D>)>>,
}

impl<E, C, D> RuntimeBuilder<E, C, D>
where
    E: Event + Clone,
    C: Command,
    D: Send + Sync + 'static,
{
    pub fn new(deps: D) -> Self {
        Self {
            deps: Arc::new(deps),
            bus: EventBus::new(),
            machines: Vec::new(),
            job_queue: Arc::new(NoOpJobQueue),
            inline: Vec::new(),
        }
    }

    pub fn with_job_queue(mut self, job_queue: Arc<dyn JobQueue>) -> Self {
        self.job_queue = job_queue;
        self
    }

    pub fn with_machine<M>(mut self, machine: M) -> Self
    where
        M: Machine<Event = E, Command = C>,
    {
        self.machines.push(Box::new(machine));
        self
    }

    /// Registers the single [`Effect`] that executes every inline command
    /// of concrete type `C2`. `C2::Event` must match the runtime's event
    /// type so the resulting fact can be re-emitted onto the same bus.
    pub fn with_effect<C2, Ef>(mut self, effect: Ef) -> Self
    where
        C2: Command,
        Ef: Effect<C2, D, Event = E>,
    {
        let bus = self.bus.clone();
        let effect = Arc::new(effect);
        self.inline.push(Box::new(move |dispatcher| {
            dispatcher.register_inline(effect, bus);
        }));
        self
    }

    pub fn build(self) -> (Runtime<E, C, D>, EventBus<E>) {
        let mut dispatcher = Dispatcher::new(self.deps, self.job_queue);
        for register in self.inline {
            register(&mut dispatcher);
        }
        let bus = self.bus.clone();
        let runtime = Runtime {
            bus: self.bus,
            machines: self.machines,
            dispatcher: Arc::new(dispatcher),
        };
        (runtime, bus)
    }
}

/// Drives `runtime`'s event loop exactly like [`Runtime::run`], except each
/// dispatch is wrapped in an [`InflightBatch`] so an [`crate::EngineHandle`]
/// can tell when a burst of reactions has fully settled.
pub(crate) async fn instrumented_run<E, C, D>(
    mut runtime: Runtime<E, C, D>,
    inflight: crate::engine::InflightTracker,
) where
    E: Event + Clone,
    C: Command,
    D: Send + Sync + 'static,
{
    let mut receiver = runtime.bus.subscribe();
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                for machine in runtime.machines.iter_mut() {
                    if let Some(cmd) = machine.decide(&envelope.event) {
                        let guard = inflight.track();
                        if let Err(err) = runtime.dispatcher.dispatch(cmd).await {
                            warn!(error = %err, "command dispatch failed");
                        }
                        drop(guard);
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "runtime lagged behind event bus, events dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                debug!("event bus closed, runtime stopping");
                break;
            }
        }
    }
}

impl<D: Send + Sync + 'static> Dispatcher<D> {
    /// Registers an [`Effect`] for inline commands of type `C2`, re-emitting
    /// the resulting event onto `bus` once execution completes.
    pub(crate) fn register_inline<C2, Ef, E>(&mut self, effect: Arc<Ef>, bus: EventBus<E>)
    where
        C2: Command,
        Ef: Effect<C2, D, Event = E>,
        E: Event + Clone,
    {
        self.insert_inline_handler::<C2, _>(move |cmd, deps| {
            let effect = effect.clone();
            let bus = bus.clone();
            Box::pin(async move {
                let ctx = EffectContext::new(deps);
                let event = effect.execute(cmd, ctx).await?;
                bus.emit(event);
                Ok(())
            })
        });
    }
}
