//! Worker runtime: decode payload, invoke the registered handler under a
//! deadline, record the outcome (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::job::{ClaimedJob, DeserializationError, JobFailure};

/// Metadata exposed to a handler alongside its typed payload (spec §4.5
/// step 3).
#[derive(Debug, Clone)]
pub struct JobMetadata {
    pub id: i64,
    pub attempt: i32,
    pub queue: String,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// Cooperative cancellation signal wired to admin cancel and to the
/// per-attempt deadline. Handlers must poll [`Cancellation::is_cancelled`]
/// or race [`Cancellation::cancelled`] against their own work (spec §4.5,
/// §5 "handlers must cooperate").
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}

/// Paired sender kept by the worker runtime; dropped (or fired) when the
/// attempt's deadline elapses or an admin cancel arrives.
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn new() -> (Self, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Cancellation { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Handler-facing error: either retryable (spec §7 "handler transient
/// error") or permanent (spec §7 "handler permanent error", the "do not
/// retry" marker).
#[derive(Debug)]
pub enum HandlerError {
    Retryable(anyhow::Error),
    Permanent(anyhow::Error),
}

impl HandlerError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    fn message(&self) -> String {
        match self {
            HandlerError::Retryable(e) => e.to_string(),
            HandlerError::Permanent(e) => e.to_string(),
        }
    }

    pub(crate) fn into_job_failure(self) -> JobFailure {
        match self {
            HandlerError::Retryable(e) => JobFailure::retryable(e.to_string()),
            HandlerError::Permanent(e) => JobFailure::permanent(e.to_string()),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for HandlerError {}

/// A registered task's business logic. `kind`-addressed rather than
/// type-addressed, since task identifiers are runtime strings (spec §4.1);
/// contrast with the compile-time [`crate::Effect`] used for inline
/// commands.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        metadata: JobMetadata,
        cancellation: Cancellation,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError>;
}

/// Adapts a typed `async fn(ctx, T, metadata) -> Result<(), HandlerError>`
/// closure into a [`TaskHandler`], doing the JSON decode spec §4.5 step 1
/// calls for and converting a decode failure into the permanent
/// [`DeserializationError`] outcome.
pub struct TypedHandler<T, F> {
    kind: &'static str,
    func: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, F, Fut> TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(JobMetadata, Cancellation, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(kind: &'static str, func: F) -> Self {
        Self {
            kind,
            func,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> TaskHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(JobMetadata, Cancellation, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        metadata: JobMetadata,
        cancellation: Cancellation,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let typed: T = serde_json::from_value(payload).map_err(|source| {
            HandlerError::Permanent(
                DeserializationError {
                    kind: self.kind.to_string(),
                    source,
                }
                .into(),
            )
        })?;
        (self.func)(metadata, cancellation, typed).await
    }
}

/// Runs one leased job to completion: deadline, handler invocation, and
/// translation of the outcome into a [`JobFailure`] (or `None` for
/// success) that [`crate::scheduler::Scheduler`] hands to the store.
pub async fn run_attempt(
    job: &ClaimedJob,
    handler: &Arc<dyn TaskHandler>,
    timeout: Duration,
    cancellation: Cancellation,
) -> Option<JobFailure> {
    let metadata = JobMetadata {
        id: job.id,
        attempt: job.attempt,
        queue: job.queue.clone(),
        created_at: job.created_at,
        tags: job.tags.clone(),
    };

    let outcome = tokio::time::timeout(
        timeout,
        handler.handle(metadata, cancellation, job.args.clone()),
    )
    .await;

    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(handler_error)) => Some(handler_error.into_job_failure()),
        Err(_elapsed) => Some(JobFailure::retryable(format!(
            "attempt exceeded {timeout:?} deadline"
        ))),
    }
}
