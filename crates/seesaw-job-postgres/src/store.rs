//! [`PgJobStore`]: the `JobStore` contract backed by Postgres.
//!
//! Grounded on the teacher's `PgJobStore::claim_ready`/`mark_failed`
//! (`FOR UPDATE SKIP LOCKED`, a transaction for the read-modify-write retry
//! decision) generalized from the teacher's five-state `job_status` enum to
//! the full `JobState` set and from its hand-rolled `2i64.pow(attempt)`
//! backoff to [`seesaw_core::retry::BackoffPolicy`].

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use seesaw_core::job::{ClaimedJob, FailureKind, JobError, JobFailure, JobState, JobStore, QueueStats};
use seesaw_core::retry::{self, BackoffPolicy};

/// Postgres-backed [`JobStore`]. Cheap to clone: wraps a [`PgPool`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn claim_ready(
        &self,
        queue: &str,
        limit: i64,
        lease: Duration,
    ) -> anyhow::Result<Vec<ClaimedJob>> {
        let lease_expires_at = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default();

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND state IN ('available', 'scheduled', 'retryable')
                  AND scheduled_at <= now()
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'running',
                attempt = jobs.attempt + 1,
                attempted_at = now(),
                lease_expires_at = $3
            FROM claimable
            WHERE jobs.id = claimable.id
            RETURNING jobs.id, jobs.kind, jobs.queue, jobs.args, jobs.attempt,
                      jobs.max_attempts, jobs.created_at, jobs.tags
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ClaimedJob {
                id: row.get("id"),
                kind: row.get("kind"),
                queue: row.get("queue"),
                args: row.get("args"),
                attempt: row.get("attempt"),
                max_attempts: row.get("max_attempts"),
                created_at: row.get("created_at"),
                tags: row.get("tags"),
            })
            .collect())
    }

    async fn mark_succeeded(&self, job_id: i64) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                finalized_at = now(),
                lease_expires_at = NULL
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Row was no longer `running` (e.g. admin-cancelled while the
            // handler was in flight). A late success never overrides an
            // already-terminal row.
            warn!(job_id, "mark_succeeded found no running row, leaving existing terminal state in place");
        } else {
            debug!(job_id, "job completed");
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, failure: JobFailure) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, attempt, max_attempts, errors FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        let state: String = row.get("state");
        if state != "running" {
            // Same race as `mark_succeeded`: the row moved to a terminal
            // state (or was never running) before this failure landed.
            warn!(job_id, state = %state, "mark_failed found a non-running row, leaving it untouched");
            tx.commit().await?;
            return Ok(());
        }

        let attempt: i32 = row.get("attempt");
        let max_attempts: i32 = row.get("max_attempts");
        let mut errors: serde_json::Value = row.get("errors");

        let entry = JobError {
            message: failure.message.clone(),
            occurred_at: Utc::now(),
            attempt,
        };
        if let serde_json::Value::Array(list) = &mut errors {
            list.push(serde_json::to_value(&entry)?);
        } else {
            errors = serde_json::json!([entry]);
        }

        let permanent = failure.kind == FailureKind::NonRetryable;
        match retry::decide(attempt, max_attempts, permanent) {
            retry::RetryDecision::Discard => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'discarded',
                        errors = $1,
                        finalized_at = now(),
                        lease_expires_at = NULL
                    WHERE id = $2
                    "#,
                )
                .bind(errors)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                warn!(job_id, attempt, max_attempts, "job discarded");
            }
            retry::RetryDecision::Retry => {
                let scheduled_at = self.backoff.next_scheduled_at(attempt, Utc::now());
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'retryable',
                        errors = $1,
                        scheduled_at = $2,
                        lease_expires_at = NULL
                    WHERE id = $3
                    "#,
                )
                .bind(errors)
                .bind(scheduled_at)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                debug!(job_id, attempt, next_attempt_at = %scheduled_at, "job scheduled for retry");
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn heartbeat(&self, job_id: i64, lease: Duration) -> anyhow::Result<()> {
        let lease_expires_at = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default();
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $1
            WHERE id = $2 AND state = 'running'
            "#,
        )
        .bind(lease_expires_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_expired_leases(&self) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query(
            r#"
            SELECT id, attempt, max_attempts
            FROM jobs
            WHERE state = 'running' AND lease_expires_at <= now()
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = 0u64;
        for row in expired {
            let job_id: i64 = row.get("id");
            let attempt: i32 = row.get("attempt");
            let max_attempts: i32 = row.get("max_attempts");

            let entry = JobError {
                message: "lease expired: worker did not report back in time".to_string(),
                occurred_at: Utc::now(),
                attempt,
            };
            let errors_append = serde_json::json!([entry]);

            match retry::decide(attempt, max_attempts, false) {
                retry::RetryDecision::Discard => {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'discarded',
                            errors = errors || $1,
                            finalized_at = now(),
                            lease_expires_at = NULL
                        WHERE id = $2
                        "#,
                    )
                    .bind(errors_append)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
                }
                retry::RetryDecision::Retry => {
                    let scheduled_at = self.backoff.next_scheduled_at(attempt, Utc::now());
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'retryable',
                            errors = errors || $1,
                            scheduled_at = $2,
                            lease_expires_at = NULL
                        WHERE id = $3
                        "#,
                    )
                    .bind(errors_append)
                    .bind(scheduled_at)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            reclaimed += 1;
        }

        tx.commit().await?;
        if reclaimed > 0 {
            warn!(reclaimed, "lease reaper reclaimed abandoned jobs");
        }
        Ok(reclaimed)
    }

    async fn sweep_scheduled(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'available'
            WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cancel(&self, job_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled',
                finalized_at = now(),
                lease_expires_at = NULL
            WHERE id = $1
              AND state NOT IN ('completed', 'discarded', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self, queue: Option<&str>) -> anyhow::Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'available')  AS pending,
                COUNT(*) FILTER (WHERE state = 'running')    AS running,
                COUNT(*) FILTER (WHERE state = 'retryable')  AS retryable,
                COUNT(*) FILTER (WHERE state = 'scheduled')  AS scheduled,
                COUNT(*) FILTER (WHERE state = 'discarded')  AS discarded
            FROM jobs
            WHERE $1::text IS NULL OR queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            retryable: row.get("retryable"),
            scheduled: row.get("scheduled"),
            discarded: row.get("discarded"),
        })
    }

    async fn list_queues(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT queue FROM jobs ORDER BY queue")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("queue")).collect())
    }
}

/// Reads one full [`seesaw_core::job::Job`] row, for admin introspection.
/// Not part of [`JobStore`] (which only exposes what the scheduler needs)
/// but used by [`crate::queue::PgJobQueue`]'s admin surface.
pub(crate) async fn fetch_job(pool: &PgPool, job_id: i64) -> anyhow::Result<Option<seesaw_core::job::Job>> {
    let row = sqlx::query(
        r#"
        SELECT id, kind, args, queue, priority, state, attempt, max_attempts, errors,
               scheduled_at, created_at, attempted_at, finalized_at, unique_key, tags
        FROM jobs WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    let state_str: String = row.get("state");
    let errors_json: serde_json::Value = row.get("errors");
    let errors: Vec<JobError> = serde_json::from_value(errors_json).unwrap_or_default();

    Ok(Some(seesaw_core::job::Job {
        id: row.get("id"),
        kind: row.get("kind"),
        args: row.get("args"),
        queue: row.get("queue"),
        priority: row.get("priority"),
        state: JobState::from_str(&state_str).map_err(anyhow::Error::from)?,
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        errors,
        scheduled_at: row.get("scheduled_at"),
        created_at: row.get("created_at"),
        attempted_at: row.get("attempted_at"),
        finalized_at: row.get("finalized_at"),
        unique_key: row.get("unique_key"),
        tags: row.get("tags"),
    }))
}
