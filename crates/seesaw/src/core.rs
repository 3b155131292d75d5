//! Core vocabulary: facts ([`Event`]) and intent ([`Command`]).
//!
//! Events describe what happened; they carry no IO and are pure data.
//! Commands describe a request for IO with transaction authority. A command
//! that opts into [`ExecutionMode::Background`] is not executed inline by an
//! effect — it is durably enqueued as a job via [`JobSpec`], which is the
//! compile-time bridge to the runtime task catalog in [`crate::job`].

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A fact: something that happened. No IO, immutable, cheaply cloned.
pub trait Event: fmt::Debug + Send + Sync + 'static {}

/// Blanket impl: any `Debug + Clone + Send + Sync + 'static` type is usable
/// as an event without a manual marker impl.
impl<T> Event for T where T: fmt::Debug + Send + Sync + 'static {}

/// How a command should be carried out once a [`Machine`](crate::Machine)
/// decides to issue it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run synchronously, in-process, by the matching [`Effect`](crate::Effect).
    Inline,
    /// Persist as a durable job and let the scheduler dispatch it later.
    Background,
    /// Persist as a durable job whose earliest eligible time is `run_at`.
    Scheduled { run_at: DateTime<Utc> },
}

/// Per-command policy overrides resolved against task-catalog defaults at
/// enqueue time (task default < job spec < per-call [`crate::job::EnqueueOptions`]).
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Task catalog identifier this command maps to, e.g. `"deliver_event"`.
    pub kind: String,
    /// Static queue name override; `None` defers to the task's resolver.
    pub queue: Option<String>,
    pub priority: Option<u8>,
    pub max_attempts: Option<i32>,
    pub unique_key: Option<String>,
    pub tags: Vec<String>,
}

impl JobSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            queue: None,
            priority: None,
            max_attempts: None,
            unique_key: None,
            tags: Vec::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }
}

/// Intent: a request for IO with transaction authority. Commands are
/// ordinary Rust enums/structs; only the ones whose [`execution_mode`] is
/// [`ExecutionMode::Background`]/[`ExecutionMode::Scheduled`] ever touch the
/// durable job queue.
///
/// [`execution_mode`]: Command::execution_mode
pub trait Command: fmt::Debug + Send + Sync + 'static {
    /// Defaults to [`ExecutionMode::Inline`]: most commands execute
    /// synchronously via their [`Effect`](crate::Effect).
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    /// Present only for commands that want to become a durable job.
    fn job_spec(&self) -> Option<JobSpec> {
        None
    }

    /// Serializes the command to the JSON payload stored in `jobs.args`.
    /// Implement with `#[derive(Serialize)]` + [`crate::auto_serialize`], or
    /// by hand for commands with custom wire shapes.
    fn serialize_to_json(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Object-safe view of a [`Command`] used where the concrete type has been
/// erased (e.g. inside the dispatcher's command queue).
pub trait AnyCommand: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn execution_mode(&self) -> ExecutionMode;
    fn job_spec(&self) -> Option<JobSpec>;
    fn serialize_to_json(&self) -> Option<serde_json::Value>;
}

impl<C: Command> AnyCommand for C {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn execution_mode(&self) -> ExecutionMode {
        Command::execution_mode(self)
    }

    fn job_spec(&self) -> Option<JobSpec> {
        Command::job_spec(self)
    }

    fn serialize_to_json(&self) -> Option<serde_json::Value> {
        Command::serialize_to_json(self)
    }
}

/// A command type that can round-trip through JSON without a hand-written
/// `serialize_to_json`. Implemented automatically for any `Serialize`.
pub trait SerializableCommand: Serialize {
    fn to_json(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()
    }
}

impl<T: Serialize> SerializableCommand for T {}

/// Groups events emitted in response to the same originating request so a
/// [`crate::EventTap`] or test harness can correlate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an event sits in a request/response exchange, used by
/// [`crate::dispatch_request`] to recognize the reply to a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    /// An event emitted as a direct consequence of a dispatched command.
    Reply,
    /// Any other event on the bus.
    Ambient,
}

/// An event plus the bookkeeping the bus and request helpers need: when it
/// was emitted and which request (if any) it correlates to.
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    pub event: E,
    pub correlation_id: Option<CorrelationId>,
    pub role: EventRole,
    pub emitted_at: DateTime<Utc>,
}

impl<E> EventEnvelope<E> {
    pub fn new(event: E) -> Self {
        Self {
            event,
            correlation_id: None,
            role: EventRole::Ambient,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self.role = EventRole::Reply;
        self
    }
}

/// A predicate used by [`crate::dispatch_request`] to recognize which of
/// several possible reply events belongs to a given request.
pub trait EnvelopeMatch<E> {
    fn matches(&self, envelope: &EventEnvelope<E>) -> bool;
}

impl<E, F> EnvelopeMatch<E> for F
where
    F: Fn(&E) -> bool,
{
    fn matches(&self, envelope: &EventEnvelope<E>) -> bool {
        (self)(&envelope.event)
    }
}

/// Chains several [`EnvelopeMatch`] predicates with OR semantics; used when
/// a request can be satisfied by more than one reply event variant
/// (success or failure).
pub struct MatchChain<E> {
    predicates: Vec<Box<dyn Fn(&EventEnvelope<E>) -> bool + Send + Sync>>,
}

impl<E> MatchChain<E> {
    pub fn new() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }

    pub fn or(mut self, pred: impl Fn(&EventEnvelope<E>) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Box::new(pred));
        self
    }
}

impl<E> Default for MatchChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EnvelopeMatch<E> for MatchChain<E> {
    fn matches(&self, envelope: &EventEnvelope<E>) -> bool {
        self.predicates.iter().any(|p| p(envelope))
    }
}
