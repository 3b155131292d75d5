//! Effects: the only place IO happens.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Command, Event};

/// Dependencies injected into every effect invocation: database pools,
/// HTTP clients, external collaborator handles (§6.1 of the job queue
/// spec — `EmailSender`, `EndpointClient`, ...). Application-defined; the
/// coordination layer only needs it to be cheaply cloneable and shareable
/// across tasks.
#[derive(Clone)]
pub struct EffectContext<D> {
    deps: Arc<D>,
}

impl<D> EffectContext<D> {
    pub fn new(deps: Arc<D>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }
}

/// A narrower view of [`EffectContext`] handed to handlers that should not
/// see the full dependency bag — e.g. a sandboxed tool invocation that only
/// needs an HTTP client, not a database pool.
pub struct ToolContext<D> {
    deps: Arc<D>,
}

impl<D> ToolContext<D> {
    pub fn new(deps: Arc<D>) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }
}

/// Executes the IO requested by a [`Command`] and returns the [`Event`]
/// recording what happened. One command maps to exactly one effect
/// implementation, registered by command type in the engine/runtime
/// builder.
#[async_trait]
pub trait Effect<C, D>: Send + Sync + 'static
where
    C: Command,
{
    type Event: Event;

    async fn execute(&self, cmd: C, ctx: EffectContext<D>) -> anyhow::Result<Self::Event>;
}
