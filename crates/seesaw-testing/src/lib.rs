//! In-memory [`seesaw_core::job::JobStore`] and fixtures for driving a
//! [`seesaw_core::scheduler::Scheduler`] in unit and stress tests without a
//! database.
//!
//! Mirrors the transition table a real backend (e.g.
//! `seesaw-job-postgres`) must implement, but keeps everything behind a
//! `Mutex<HashMap<..>>` instead of SQL so tests run in microseconds and
//! without Docker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use seesaw_core::job::{
    ClaimedJob, EnqueueOptions, EnqueueOutcome, JobError, JobFailure, JobState, JobStore,
    QueueStats, TaskDefinition,
};
use seesaw_core::retry::{self, BackoffPolicy};

struct Row {
    id: i64,
    kind: String,
    args: serde_json::Value,
    queue: String,
    priority: i16,
    state: JobState,
    attempt: i32,
    max_attempts: i32,
    errors: Vec<JobError>,
    scheduled_at: chrono::DateTime<Utc>,
    created_at: chrono::DateTime<Utc>,
    attempted_at: Option<chrono::DateTime<Utc>>,
    finalized_at: Option<chrono::DateTime<Utc>>,
    unique_key: Option<String>,
    fingerprint: Option<String>,
    tags: Vec<String>,
    lease_expires_at: Option<chrono::DateTime<Utc>>,
}

/// A single-process stand-in for a Postgres-backed store. Enqueue is not
/// part of the [`JobStore`] trait (real backends need transactional
/// co-commit, spec §4.3 `EnqueueInTx`/`EnqueueWithWork`) so it is an
/// inherent method here too, matching the split documented for
/// `seesaw-job-postgres`.
pub struct InMemoryJobStore {
    rows: Mutex<HashMap<i64, Row>>,
    next_id: AtomicI64,
    backoff: BackoffPolicy,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Enqueues one job, applying the uniqueness policy the same way a real
    /// backend's `INSERT ... ON CONFLICT` upsert would: an existing row with
    /// the same fingerprint in one of `policy.by_state` (and, if set, still
    /// inside `policy.by_period`) is returned unchanged instead of a new row
    /// being created.
    pub fn enqueue(
        &self,
        definition: &TaskDefinition,
        args: serde_json::Value,
        options: EnqueueOptions,
    ) -> anyhow::Result<EnqueueOutcome> {
        let queue = options
            .queue
            .clone()
            .map(Ok)
            .unwrap_or_else(|| definition.queue_resolver.resolve(&args).map_err(anyhow::Error::from))?;

        let fingerprint = definition.uniqueness_policy.as_ref().map(|policy| {
            seesaw_core::job::compute_fingerprint(
                &definition.identifier,
                &args,
                policy,
                options.unique_key.as_deref(),
            )
        });

        let mut rows = self.rows.lock().unwrap();

        if let (Some(fp), Some(policy)) = (&fingerprint, &definition.uniqueness_policy) {
            let now = Utc::now();
            let existing = rows.values().find(|row| {
                row.fingerprint.as_deref() == Some(fp.as_str())
                    && policy.by_state.contains(&row.state)
                    && policy
                        .by_period
                        .map(|period| now.signed_duration_since(row.created_at).to_std().unwrap_or_default() <= period)
                        .unwrap_or(true)
            });
            if let Some(existing) = existing {
                return Ok(EnqueueOutcome {
                    job_id: existing.id,
                    new: false,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let priority = match options.priority {
            Some(raw) => seesaw_core::job::clamp_priority(Some(raw)),
            None => definition.default_priority as i16,
        };
        let max_attempts = options.max_attempts.unwrap_or(definition.default_max_attempts);
        let now = Utc::now();
        let scheduled_at = options.scheduled_at.unwrap_or(now);
        let state = if scheduled_at > now {
            JobState::Scheduled
        } else {
            JobState::Available
        };

        rows.insert(
            id,
            Row {
                id,
                kind: definition.identifier.clone(),
                args,
                queue,
                priority,
                state,
                attempt: 0,
                max_attempts,
                errors: Vec::new(),
                scheduled_at,
                created_at: now,
                attempted_at: None,
                finalized_at: None,
                unique_key: options.unique_key,
                fingerprint,
                tags: options.tags,
                lease_expires_at: None,
            },
        );

        Ok(EnqueueOutcome { job_id: id, new: true })
    }

    pub fn get(&self, job_id: i64) -> Option<seesaw_core::job::Job> {
        self.rows.lock().unwrap().get(&job_id).map(row_to_job)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn row_to_job(row: &Row) -> seesaw_core::job::Job {
    seesaw_core::job::Job {
        id: row.id,
        kind: row.kind.clone(),
        args: row.args.clone(),
        queue: row.queue.clone(),
        priority: row.priority,
        state: row.state,
        attempt: row.attempt,
        max_attempts: row.max_attempts,
        errors: row.errors.clone(),
        scheduled_at: row.scheduled_at,
        created_at: row.created_at,
        attempted_at: row.attempted_at,
        finalized_at: row.finalized_at,
        unique_key: row.unique_key.clone(),
        tags: row.tags.clone(),
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_ready(
        &self,
        queue: &str,
        limit: i64,
        lease: Duration,
    ) -> anyhow::Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();

        let mut eligible: Vec<i64> = rows
            .values()
            .filter(|row| {
                row.queue == queue
                    && matches!(row.state, JobState::Available | JobState::Scheduled | JobState::Retryable)
                    && row.scheduled_at <= now
            })
            .map(|row| row.id)
            .collect();

        eligible.sort_by_key(|id| {
            let row = &rows[id];
            (row.priority, row.scheduled_at, row.id)
        });
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let row = rows.get_mut(&id).expect("id came from this map");
            row.state = JobState::Running;
            row.attempt += 1;
            row.attempted_at = Some(now);
            row.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
            claimed.push(ClaimedJob {
                id: row.id,
                kind: row.kind.clone(),
                queue: row.queue.clone(),
                args: row.args.clone(),
                attempt: row.attempt,
                max_attempts: row.max_attempts,
                created_at: row.created_at,
                tags: row.tags.clone(),
            });
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: i64) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&job_id) {
            // A late success must not override a row that moved to a
            // terminal state (e.g. admin-cancelled) while the handler was
            // still running.
            if row.state == JobState::Running {
                row.state = JobState::Completed;
                row.finalized_at = Some(Utc::now());
                row.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, failure: JobFailure) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&job_id) {
            if row.state != JobState::Running {
                return Ok(());
            }
            row.errors.push(JobError {
                message: failure.message.clone(),
                occurred_at: Utc::now(),
                attempt: row.attempt,
            });
            row.lease_expires_at = None;

            let permanent = failure.kind == seesaw_core::job::FailureKind::NonRetryable;
            match retry::decide(row.attempt, row.max_attempts, permanent) {
                retry::RetryDecision::Discard => {
                    row.state = JobState::Discarded;
                    row.finalized_at = Some(Utc::now());
                }
                retry::RetryDecision::Retry => {
                    row.state = JobState::Retryable;
                    row.scheduled_at = self.backoff.next_scheduled_at(row.attempt, Utc::now());
                }
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, job_id: i64, lease: Duration) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&job_id) {
            row.lease_expires_at = Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default());
        }
        Ok(())
    }

    async fn reap_expired_leases(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let mut reclaimed = 0u64;
        for row in rows.values_mut() {
            if row.state == JobState::Running {
                if let Some(expires) = row.lease_expires_at {
                    if expires <= now {
                        row.errors.push(JobError {
                            message: "lease expired: worker did not report back in time".into(),
                            occurred_at: now,
                            attempt: row.attempt,
                        });
                        row.lease_expires_at = None;
                        match retry::decide(row.attempt, row.max_attempts, false) {
                            retry::RetryDecision::Discard => {
                                row.state = JobState::Discarded;
                                row.finalized_at = Some(now);
                            }
                            retry::RetryDecision::Retry => {
                                row.state = JobState::Retryable;
                                row.scheduled_at = self.backoff.next_scheduled_at(row.attempt, now);
                            }
                        }
                        reclaimed += 1;
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    async fn sweep_scheduled(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let mut promoted = 0u64;
        for row in rows.values_mut() {
            if matches!(row.state, JobState::Scheduled | JobState::Retryable) && row.scheduled_at <= now {
                row.state = JobState::Available;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn cancel(&self, job_id: i64) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&job_id) {
            Some(row) if !row.state.is_terminal() => {
                row.state = JobState::Cancelled;
                row.finalized_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self, queue: Option<&str>) -> anyhow::Result<QueueStats> {
        let rows = self.rows.lock().unwrap();
        let mut stats = QueueStats::default();
        for row in rows.values() {
            if let Some(queue) = queue {
                if row.queue != queue {
                    continue;
                }
            }
            match row.state {
                JobState::Available => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Retryable => stats.retryable += 1,
                JobState::Scheduled => stats.scheduled += 1,
                JobState::Discarded => stats.discarded += 1,
                JobState::Completed | JobState::Cancelled => {}
            }
        }
        Ok(stats)
    }

    async fn list_queues(&self) -> anyhow::Result<Vec<String>> {
        let rows = self.rows.lock().unwrap();
        let mut queues: Vec<String> = rows.values().map(|row| row.queue.clone()).collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait as at;
    use seesaw_core::job::QueueResolver;
    use seesaw_core::worker::{Cancellation, HandlerError, JobMetadata, TaskHandler};
    use std::sync::Arc;

    struct NoopHandler;

    #[at]
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

    fn definition(identifier: &str) -> TaskDefinition {
        TaskDefinition::new(identifier, QueueResolver::static_name("default"), Arc::new(NoopHandler))
    }

    #[tokio::test]
    async fn claimed_job_transitions_to_completed() {
        let store = InMemoryJobStore::new();
        let outcome = store
            .enqueue(&definition("ping"), serde_json::json!({}), EnqueueOptions::default())
            .unwrap();
        assert!(outcome.new);

        let claimed = store.claim_ready("default", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);

        store.mark_succeeded(claimed[0].id).await.unwrap();
        let job = store.get(claimed[0].id).unwrap();
        assert_eq!(job.state, seesaw_core::job::JobState::Completed);
    }

    #[tokio::test]
    async fn duplicate_enqueue_collapses_under_uniqueness_policy() {
        let store = InMemoryJobStore::new();
        let def = definition("ping").with_uniqueness(seesaw_core::job::UniquenessPolicy::by_args(["id"]));
        let args = serde_json::json!({"id": "abc"});

        let first = store.enqueue(&def, args.clone(), EnqueueOptions::default()).unwrap();
        let second = store.enqueue(&def, args, EnqueueOptions::default()).unwrap();

        assert!(first.new);
        assert!(!second.new);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failed_job_under_max_attempts_becomes_retryable() {
        let store = InMemoryJobStore::new();
        let def = definition("ping").with_max_attempts(3);
        let outcome = store.enqueue(&def, serde_json::json!({}), EnqueueOptions::default()).unwrap();

        let claimed = store.claim_ready("default", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed[0].id, outcome.job_id);

        store
            .mark_failed(outcome.job_id, seesaw_core::job::JobFailure::retryable("boom"))
            .await
            .unwrap();

        let job = store.get(outcome.job_id).unwrap();
        assert_eq!(job.state, seesaw_core::job::JobState::Retryable);
        assert_eq!(job.errors.len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reaped_back_to_retryable() {
        let store = InMemoryJobStore::new();
        let outcome = store
            .enqueue(&definition("ping"), serde_json::json!({}), EnqueueOptions::default())
            .unwrap();

        store
            .claim_ready("default", 10, Duration::from_millis(0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.reap_expired_leases().await.unwrap();
        assert_eq!(reclaimed, 1);

        let job = store.get(outcome.job_id).unwrap();
        assert_eq!(job.state, seesaw_core::job::JobState::Retryable);
    }
}
