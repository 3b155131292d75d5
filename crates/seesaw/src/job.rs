//! The durable job queue core: job model, task catalog, queue resolution,
//! and the [`JobStore`] contract a concrete backend (e.g.
//! `seesaw-job-postgres`) must satisfy.
//!
//! This module is storage-agnostic — no `sqlx` dependency — so it can be
//! unit tested in isolation and so [`crate::scheduler`] can drive any
//! `JobStore` implementation, including the in-memory one in
//! `seesaw-testing`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::SeesawError;

// ---------------------------------------------------------------------
// Job state machine (spec §3.4)
// ---------------------------------------------------------------------

/// One node of the job state machine. See `spec.md` §3.4 for the full
/// transition table; [`crate::scheduler`] and the retry engine are the only
/// code allowed to move a job between states (besides an explicit admin
/// cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Available,
    Scheduled,
    Running,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
}

impl JobState {
    /// A row in one of these states still has work left to do.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    pub fn all() -> [JobState; 7] {
        [
            JobState::Available,
            JobState::Scheduled,
            JobState::Running,
            JobState::Retryable,
            JobState::Completed,
            JobState::Discarded,
            JobState::Cancelled,
        ]
    }

    /// Default uniqueness state filter per spec §4.7: "any non-terminal
    /// state".
    pub fn non_terminal() -> Vec<JobState> {
        Self::all().into_iter().filter(|s| !s.is_terminal()).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = SeesawError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobState::Available),
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "retryable" => Ok(JobState::Retryable),
            "completed" => Ok(JobState::Completed),
            "discarded" => Ok(JobState::Discarded),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(SeesawError::InvalidPayload {
                kind: "job_state".into(),
                reason: format!("unrecognized job state {other:?}"),
            }),
        }
    }
}

/// One entry in a job's ordered failure history (spec §3.1 `errors`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobError {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub attempt: i32,
}

/// The full durable row, as read back by admin/introspection. Workers see
/// only the narrower [`ClaimedJob`].
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: String,
    pub args: serde_json::Value,
    pub queue: String,
    pub priority: i16,
    pub state: JobState,
    pub attempt: i32,
    pub max_attempts: i32,
    pub errors: Vec<JobError>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub unique_key: Option<String>,
    pub tags: Vec<String>,
}

/// The subset of a job a worker actually needs once it has been leased.
/// Deliberately excludes `errors`/`finalized_at` etc. — history is an
/// admin-facing concern, not a worker-facing one.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub kind: String,
    pub queue: String,
    pub args: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// How the worker runtime should classify a handler's error before handing
/// it to the retry engine (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

/// A reported failure, ready for [`JobStore::mark_failed`].
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub kind: FailureKind,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retryable,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::NonRetryable,
        }
    }
}

/// Raised by the worker runtime when `args` cannot be deserialized into the
/// handler's expected payload type. Always permanent (spec §7: "schema
/// mismatch will not self-heal").
#[derive(Debug, Error)]
#[error("failed to deserialize payload for task {kind}: {source}")]
pub struct DeserializationError {
    pub kind: String,
    #[source]
    pub source: serde_json::Error,
}

// ---------------------------------------------------------------------
// Queue resolution (spec §4.2)
// ---------------------------------------------------------------------

/// Selects a job's queue name at enqueue time, either statically or as a
/// pure function of the payload (e.g. `runs_<id>` per-tenant sharding).
#[derive(Clone)]
pub enum QueueResolver {
    Static(String),
    Dynamic(Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<String> + Send + Sync>),
}

impl QueueResolver {
    pub fn static_name(name: impl Into<String>) -> Self {
        Self::Static(name.into())
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, payload: &serde_json::Value) -> Result<String, SeesawError> {
        let name = match self {
            QueueResolver::Static(name) => name.clone(),
            QueueResolver::Dynamic(f) => f(payload).map_err(|source| SeesawError::InvalidQueue(
                String::new(),
                "dynamic resolver failed",
            ).tap_source(source))?,
        };
        validate_queue_name(&name)?;
        Ok(name)
    }
}

impl fmt::Debug for QueueResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueResolver::Static(name) => f.debug_tuple("Static").field(name).finish(),
            QueueResolver::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

// small helper so the dynamic-resolver-failed error still carries the
// underlying anyhow cause without widening SeesawError's shape.
trait TapSource {
    fn tap_source(self, source: anyhow::Error) -> Self;
}

impl TapSource for SeesawError {
    fn tap_source(self, source: anyhow::Error) -> Self {
        if let SeesawError::InvalidQueue(_, reason) = &self {
            tracing::debug!(error = %source, reason, "queue resolver failed");
        }
        self
    }
}

/// Bounded identifier rule for queue names (spec §4.2): ASCII,
/// `[a-zA-Z0-9_-]`, length 1..=128.
pub fn validate_queue_name(name: &str) -> Result<(), SeesawError> {
    if name.is_empty() || name.len() > 128 {
        return Err(SeesawError::InvalidQueue(
            name.to_string(),
            "must be 1..=128 characters",
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SeesawError::InvalidQueue(
            name.to_string(),
            "must match [a-zA-Z0-9_-]",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Priority (spec §3.1, §4.3, §8 boundary behaviors)
// ---------------------------------------------------------------------

/// Maps a caller-supplied, possibly wide-range priority onto the core's
/// `1..=4` scale (1 = highest). `None` and `Some(0)` both mean "unspecified"
/// and clamp to `2` (normal), matching spec §8's boundary case
/// (`priority = 0` clamps to `2`) while `1..=25 -> 1`, `26..=50 -> 2`,
/// `51..=75 -> 3`, `76.. -> 4` covers the documented wide-range mapping.
pub fn clamp_priority(raw: Option<u32>) -> i16 {
    match raw {
        None | Some(0) => 2,
        Some(p @ 1..=25) => {
            let _ = p;
            1
        }
        Some(26..=50) => 2,
        Some(51..=75) => 3,
        Some(_) => 4,
    }
}

// ---------------------------------------------------------------------
// Uniqueness policy (spec §4.7)
// ---------------------------------------------------------------------

/// Combination of uniqueness scope/window a task declares for itself.
/// `None` (the default `TaskDefinition::uniqueness_policy`) means the task
/// has no uniqueness constraint at all.
#[derive(Debug, Clone)]
pub struct UniquenessPolicy {
    /// Fold `args_subset` (below) into the fingerprint.
    pub by_args: bool,
    /// Fields of the payload to include when `by_args` is set. An explicit
    /// `job_key` field on the payload is always folded in regardless of
    /// this list.
    pub args_subset: Vec<String>,
    /// Only rows within this age are considered for collapsing a duplicate
    /// enqueue. `None` means unbounded (state filter alone decides).
    pub by_period: Option<Duration>,
    /// States considered "still active" for uniqueness purposes. Defaults
    /// to [`JobState::non_terminal`].
    pub by_state: Vec<JobState>,
}

impl Default for UniquenessPolicy {
    fn default() -> Self {
        Self {
            by_args: false,
            args_subset: Vec::new(),
            by_period: None,
            by_state: JobState::non_terminal(),
        }
    }
}

impl UniquenessPolicy {
    pub fn by_args(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            by_args: true,
            args_subset: fields.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn within(mut self, period: Duration) -> Self {
        self.by_period = Some(period);
        self
    }

    pub fn while_in(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.by_state = states.into_iter().collect();
        self
    }
}

/// Deterministic fingerprint of `(kind, selected args fields, explicit
/// job_key)`. Two enqueue attempts with the same fingerprint and an active
/// row within the uniqueness window collapse to one job (spec §4.7).
pub fn compute_fingerprint(
    kind: &str,
    args: &serde_json::Value,
    policy: &UniquenessPolicy,
    explicit_job_key: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\0");

    if policy.by_args {
        let subset = canonical_subset(args, &policy.args_subset);
        hasher.update(subset.as_bytes());
    }
    hasher.update(b"\0");

    if let Some(job_key) = explicit_job_key {
        hasher.update(job_key.as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

/// Builds a canonical (stably ordered) JSON-ish string for the declared
/// subset of fields so that key order in the caller's payload never
/// changes the fingerprint.
fn canonical_subset(args: &serde_json::Value, fields: &[String]) -> String {
    let mut parts: Vec<(String, String)> = fields
        .iter()
        .map(|field| {
            let value = args
                .get(field)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            (field.clone(), value)
        })
        .collect();
    parts.sort_by(|a, b| a.0.cmp(&b.0));
    parts
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

// ---------------------------------------------------------------------
// Task catalog (spec §4.1)
// ---------------------------------------------------------------------

/// A compile-time/startup-time record: identifier, queue resolution,
/// defaults, uniqueness policy, and per-attempt timeout. Immutable once
/// registered.
#[derive(Clone)]
pub struct TaskDefinition {
    pub identifier: String,
    pub queue_resolver: QueueResolver,
    pub default_priority: u8,
    pub default_max_attempts: i32,
    pub uniqueness_policy: Option<UniquenessPolicy>,
    pub timeout: Duration,
    pub handler: Arc<dyn crate::worker::TaskHandler>,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("identifier", &self.identifier)
            .field("queue_resolver", &self.queue_resolver)
            .field("default_priority", &self.default_priority)
            .field("default_max_attempts", &self.default_max_attempts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TaskDefinition {
    pub fn new(
        identifier: impl Into<String>,
        queue: QueueResolver,
        handler: Arc<dyn crate::worker::TaskHandler>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            queue_resolver: queue,
            default_priority: 2,
            default_max_attempts: 3,
            uniqueness_policy: None,
            timeout: Duration::from_secs(30),
            handler,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_uniqueness(mut self, policy: UniquenessPolicy) -> Self {
        self.uniqueness_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The process-wide task catalog: `identifier -> TaskDefinition`.
/// Publish-once/read-many: populated during `Initialize`, frozen before
/// `Start`. Reads after freezing never take a lock (`DashMap`'s sharded
/// read path), matching spec §4.1's "safe concurrent reads against
/// initialization writes" requirement.
#[derive(Default)]
pub struct CommandRegistry {
    tasks: DashMap<String, Arc<TaskDefinition>>,
    frozen: AtomicBool,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a task definition. Fails if the identifier is already
    /// registered, or if the catalog has been [`CommandRegistry::freeze`]d.
    pub fn register(&self, definition: TaskDefinition) -> Result<(), SeesawError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(SeesawError::InvalidPayload {
                kind: definition.identifier,
                reason: "catalog is frozen; register() must run during Initialize".into(),
            });
        }
        let identifier = definition.identifier.clone();
        if self.tasks.contains_key(&identifier) {
            return Err(SeesawError::InvalidPayload {
                kind: identifier,
                reason: "task identifier already registered".into(),
            });
        }
        self.tasks.insert(identifier, Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, identifier: &str) -> Result<Arc<TaskDefinition>, SeesawError> {
        self.tasks
            .get(identifier)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SeesawError::UnknownTask(identifier.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }

    /// Called by `Initialize` once all tasks are registered; `register`
    /// fails after this point, matching the "frozen before `Start`" rule.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------
// Enqueue options (spec §4.3)
// ---------------------------------------------------------------------

/// Per-call overrides; resolution order is per-call > task default > system
/// default (spec §4.3 step 3).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<u32>,
    pub max_attempts: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub unique_key: Option<String>,
    pub tags: Vec<String>,
    pub queue: Option<String>,
}

/// Result of one enqueue call (spec §6.2).
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    pub job_id: i64,
    pub new: bool,
}

/// Statistics for admin introspection (spec §6.2). Field names follow
/// `spec.md` verbatim; `pending` counts rows in [`JobState::Available`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub retryable: i64,
    pub scheduled: i64,
    pub discarded: i64,
}

// ---------------------------------------------------------------------
// Storage contract (spec §4.4, §6.3)
// ---------------------------------------------------------------------

/// The contract a durable backend implements. Storage-agnostic by design so
/// [`crate::scheduler::Scheduler`] can drive a Postgres-backed store in
/// production and an in-memory one in tests without duplicating fetch/retry
/// logic.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Leases up to `limit` eligible rows from `queue`
    /// (`state ∈ {available, scheduled, retryable}` and `scheduled_at <=
    /// now`), atomically transitioning them to `running` and stamping
    /// `attempted_at`/`attempt`. Ordered `(priority, scheduled_at, id)`.
    async fn claim_ready(
        &self,
        queue: &str,
        limit: i64,
        lease: Duration,
    ) -> anyhow::Result<Vec<ClaimedJob>>;

    async fn mark_succeeded(&self, job_id: i64) -> anyhow::Result<()>;

    /// Applies the retry/discard policy for `failure` against the task's
    /// `max_attempts` (spec §4.6).
    async fn mark_failed(&self, job_id: i64, failure: JobFailure) -> anyhow::Result<()>;

    /// Extends a running job's lease; used by long-running handlers.
    async fn heartbeat(&self, job_id: i64, lease: Duration) -> anyhow::Result<()>;

    /// Returns `running` rows whose lease has expired to `retryable` with a
    /// synthetic "lease lost" error. Returns the count reclaimed.
    async fn reap_expired_leases(&self) -> anyhow::Result<u64>;

    /// Promotes `scheduled`/`retryable` rows whose `scheduled_at <= now` to
    /// `available`. Returns the count promoted.
    async fn sweep_scheduled(&self) -> anyhow::Result<u64>;

    /// Admin cancel: non-terminal -> cancelled. Returns `false` if the job
    /// was already terminal or did not exist.
    async fn cancel(&self, job_id: i64) -> anyhow::Result<bool>;

    async fn stats(&self, queue: Option<&str>) -> anyhow::Result<QueueStats>;

    async fn list_queues(&self) -> anyhow::Result<Vec<String>>;

    async fn health(&self) -> anyhow::Result<bool> {
        self.stats(None).await.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Cancellation, HandlerError, JobMetadata, TaskHandler};
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(
            &self,
            _metadata: JobMetadata,
            _cancellation: Cancellation,
            _payload: serde_json::Value,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn test_definition(identifier: &str) -> TaskDefinition {
        TaskDefinition::new(
            identifier,
            QueueResolver::static_name("events"),
            Arc::new(NoopHandler),
        )
    }

    #[test]
    fn priority_clamps_per_spec_boundaries() {
        assert_eq!(clamp_priority(None), 2);
        assert_eq!(clamp_priority(Some(0)), 2);
        assert_eq!(clamp_priority(Some(1)), 1);
        assert_eq!(clamp_priority(Some(25)), 1);
        assert_eq!(clamp_priority(Some(26)), 2);
        assert_eq!(clamp_priority(Some(50)), 2);
        assert_eq!(clamp_priority(Some(51)), 3);
        assert_eq!(clamp_priority(Some(75)), 3);
        assert_eq!(clamp_priority(Some(76)), 4);
        assert_eq!(clamp_priority(Some(101)), 4);
    }

    #[test]
    fn queue_name_validation() {
        assert!(validate_queue_name("runs_run-12345").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(&"a".repeat(129)).is_err());
        assert!(validate_queue_name("bad queue!").is_err());
    }

    #[test]
    fn fingerprint_is_deterministic_across_key_order() {
        let policy = UniquenessPolicy::by_args(["endpoint_id", "source"]);
        let a = serde_json::json!({"endpoint_id": "ep_1", "source": "API", "reason": "x"});
        let b = serde_json::json!({"source": "API", "reason": "y", "endpoint_id": "ep_1"});
        assert_eq!(
            compute_fingerprint("index_endpoint", &a, &policy, None),
            compute_fingerprint("index_endpoint", &b, &policy, None)
        );
    }

    #[test]
    fn fingerprint_changes_with_explicit_job_key() {
        let policy = UniquenessPolicy::default();
        let args = serde_json::json!({});
        let a = compute_fingerprint("t", &args, &policy, Some("one"));
        let b = compute_fingerprint("t", &args, &policy, Some("two"));
        assert_ne!(a, b);
    }

    #[test]
    fn catalog_rejects_duplicate_registration() {
        let catalog = CommandRegistry::new();
        let def = test_definition("deliver_event");
        catalog.register(def.clone()).unwrap();
        assert!(catalog.register(def).is_err());
    }

    #[test]
    fn catalog_rejects_register_after_freeze() {
        let catalog = CommandRegistry::new();
        catalog.freeze();
        let def = test_definition("deliver_event");
        assert!(catalog.register(def).is_err());
    }

    #[test]
    fn catalog_lookup_unknown_task() {
        let catalog = CommandRegistry::new();
        assert!(matches!(
            catalog.lookup("nope"),
            Err(SeesawError::UnknownTask(_))
        ));
    }

    #[test]
    fn non_terminal_excludes_terminal_states() {
        let states = JobState::non_terminal();
        assert!(states.contains(&JobState::Available));
        assert!(!states.contains(&JobState::Completed));
        assert!(!states.contains(&JobState::Discarded));
        assert!(!states.contains(&JobState::Cancelled));
    }
}
