//! Routes a machine's decided command to either an inline [`Effect`] or the
//! durable job queue, depending on [`ExecutionMode`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Command, ExecutionMode, JobSpec};
use crate::error::SeesawError;

/// Minimal durable hand-off surface the dispatcher needs: "persist this
/// command as a job". The full task catalog / scheduler / retry engine
/// contract lives in [`crate::job::JobStore`]; application wiring usually
/// implements `JobQueue` as a thin adapter over a `JobStore` plus
/// [`crate::job::CommandRegistry`] lookup.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueue a command that opted into [`ExecutionMode::Background`] or
    /// [`ExecutionMode::Scheduled`]. Returns the durable job id.
    async fn enqueue(&self, spec: JobSpec, payload: serde_json::Value) -> Result<i64, SeesawError>;
}

/// A [`JobQueue`] that refuses every background command. Useful for
/// inline-only engines (tests, the `http-fetcher`/`ai-summarizer` demos)
/// that never register a background command.
pub struct NoOpJobQueue;

#[async_trait]
impl JobQueue for NoOpJobQueue {
    async fn enqueue(&self, spec: JobSpec, _payload: serde_json::Value) -> Result<i64, SeesawError> {
        Err(SeesawError::UnknownTask(format!(
            "no JobQueue configured to accept background command {:?}",
            spec.kind
        )))
    }
}

/// Type-erased effect invocation, keyed by the command's concrete Rust
/// type so [`Dispatcher::dispatch`] can route without a match statement
/// per command.
type InlineHandler<D> = Box<
    dyn Fn(
            Box<dyn std::any::Any + Send>,
            Arc<D>,
        ) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Dispatches decided commands: inline commands run through their
/// registered [`Effect`](crate::Effect) immediately; background/scheduled
/// commands are hashed by command type id and handed to the [`JobQueue`].
pub struct Dispatcher<D> {
    deps: Arc<D>,
    job_queue: Arc<dyn JobQueue>,
    inline_handlers: HashMap<std::any::TypeId, InlineHandler<D>>,
}

impl<D: Send + Sync + 'static> Dispatcher<D> {
    pub fn new(deps: Arc<D>, job_queue: Arc<dyn JobQueue>) -> Self {
        Self {
            deps,
            job_queue,
            inline_handlers: HashMap::new(),
        }
    }

    pub fn with_job_queue(deps: Arc<D>, job_queue: Arc<dyn JobQueue>) -> Self {
        Self::new(deps, job_queue)
    }

    /// Registers the boxed-closure form of an inline handler for command
    /// type `C2`, keyed by `TypeId`. [`crate::runtime::RuntimeBuilder`] and
    /// [`crate::engine::EngineBuilder`] use this to wire up `with_effect`.
    pub(crate) fn insert_inline_handler<C2, F>(&mut self, f: F)
    where
        C2: Command,
        F: Fn(C2, Arc<D>) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let handler: InlineHandler<D> = Box::new(move |boxed_any, deps| {
            let cmd = *boxed_any
                .downcast::<C2>()
                .expect("inline handler registered for mismatched command type");
            f(cmd, deps)
        });
        self.inline_handlers.insert(std::any::TypeId::of::<C2>(), handler);
    }

    /// Route a single command. Inline commands without a registered effect
    /// are a programming error surfaced as [`SeesawError::UnknownTask`];
    /// background commands without a [`JobSpec`] are rejected the same way.
    pub async fn dispatch<C: Command>(&self, cmd: C) -> Result<(), SeesawError> {
        match cmd.execution_mode() {
            ExecutionMode::Inline => {
                let type_id = std::any::TypeId::of::<C>();
                let handler = self.inline_handlers.get(&type_id).ok_or_else(|| {
                    SeesawError::UnknownTask(format!(
                        "no inline effect registered for {}",
                        std::any::type_name::<C>()
                    ))
                })?;
                (handler)(Box::new(cmd), self.deps.clone())
                    .await
                    .map_err(|source| SeesawError::EffectFailed {
                        command: std::any::type_name::<C>(),
                        source,
                    })
            }
            ExecutionMode::Background | ExecutionMode::Scheduled { .. } => {
                let mut spec = cmd.job_spec().ok_or_else(|| {
                    SeesawError::UnknownTask(format!(
                        "command {} opted into background execution without a JobSpec",
                        std::any::type_name::<C>()
                    ))
                })?;
                if let ExecutionMode::Scheduled { run_at } = cmd.execution_mode() {
                    spec.tags.push(format!("scheduled_at={}", run_at.to_rfc3339()));
                }
                let payload = cmd.serialize_to_json().ok_or_else(|| {
                    SeesawError::InvalidPayload {
                        kind: spec.kind.clone(),
                        reason: "serialize_to_json returned None".into(),
                    }
                })?;
                self.job_queue.enqueue(spec, payload).await.map(|_| ())
            }
        }
    }
}
