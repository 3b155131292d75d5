//! [`PgJobQueue`]: the facade applications actually construct — owns the
//! pool, the task catalog, and the running scheduler, and exposes the
//! caller-facing API (spec §6.2): `Enqueue`/`EnqueueInTx`/`EnqueueWithWork`,
//! `Cancel`, `Stats`, `Health`, plus `Initialize`/`Start`/`Stop` lifecycle.
//!
//! Transactional enqueue lives here, not on [`crate::store::PgJobStore`] /
//! [`seesaw_core::job::JobStore`], because it needs a concrete
//! `sqlx::Transaction<'_, Postgres>` the caller can also write to — the
//! same "caller writes + one more row, one commit" shape as the teacher's
//! `seesaw-outbox` transactional outbox.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use seesaw_core::core::JobSpec;
use seesaw_core::dispatch::JobQueue;
use seesaw_core::error::SeesawError;
use seesaw_core::job::{
    clamp_priority, compute_fingerprint, CommandRegistry, EnqueueOptions, EnqueueOutcome, Job,
    JobStore, QueueStats, UniquenessPolicy,
};
use seesaw_core::scheduler::{RunningScheduler, Scheduler, SchedulerConfig};

use crate::error::JobQueueError;
use crate::store::{fetch_job, PgJobStore};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub struct PgJobQueue {
    store: Arc<PgJobStore>,
    catalog: Arc<CommandRegistry>,
    scheduler_config: SchedulerConfig,
    started: Mutex<Option<StartedState>>,
}

struct StartedState {
    running: RunningScheduler,
    discovery_task: tokio::task::JoinHandle<()>,
}

impl PgJobQueue {
    /// Runs pending migrations and freezes the catalog. Must be called
    /// before [`PgJobQueue::start`]; task registration happens on `catalog`
    /// before this call (spec §4.1 "frozen before Start").
    pub async fn initialize(
        pool: PgPool,
        catalog: Arc<CommandRegistry>,
        scheduler_config: SchedulerConfig,
    ) -> Result<Self, JobQueueError> {
        MIGRATOR.run(&pool).await?;
        catalog.freeze();
        Ok(Self {
            store: Arc::new(PgJobStore::new(pool)),
            catalog,
            scheduler_config,
            started: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<PgJobStore> {
        &self.store
    }

    /// Starts the scheduler: one fetch loop per statically-resolved queue
    /// in the catalog immediately, plus a discovery loop that polls
    /// `list_queues` for dynamically-resolved queue names (spec §4.2's
    /// `runs_<id>` style sharding) and starts a fetch loop for each one
    /// seen for the first time.
    pub fn start(&self) {
        let mut guard = self.started.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let static_queues = self.static_queue_names();
        let known_queues = Arc::new(Mutex::new(static_queues.iter().cloned().collect::<HashSet<_>>()));

        let scheduler = Arc::new(Scheduler::new(
            self.store.clone(),
            self.catalog.clone(),
            self.scheduler_config.clone(),
        ));
        let running = scheduler.start(static_queues);

        let discovery_task = tokio::spawn(discover_dynamic_queues(
            self.store.clone(),
            scheduler,
            running.clone(),
            known_queues,
            self.scheduler_config.poll_interval,
        ));

        *guard = Some(StartedState {
            running,
            discovery_task,
        });
        info!("job queue started");
    }

    /// Aborts every fetch loop, the maintenance loop, and the queue
    /// discovery loop. In-flight handler invocations are left running;
    /// their leases expire and the reaper recovers them on the next
    /// `Start` (spec §5 shutdown semantics).
    pub fn stop(&self) {
        if let Some(state) = self.started.lock().unwrap().take() {
            state.discovery_task.abort();
            state.running.stop();
        }
    }

    fn static_queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .catalog
            .list()
            .into_iter()
            .filter_map(|kind| self.catalog.lookup(&kind).ok())
            .filter_map(|def| match &def.queue_resolver {
                seesaw_core::job::QueueResolver::Static(name) => Some(name.clone()),
                seesaw_core::job::QueueResolver::Dynamic(_) => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// `Enqueue` (spec §6.2): opens its own transaction and commits it.
    pub async fn enqueue(
        &self,
        kind: &str,
        args: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobQueueError> {
        let mut tx = self.store.pool().begin().await?;
        let outcome = self.enqueue_in_tx(&mut tx, kind, args, options).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// `EnqueueInTx` (spec §6.2): the caller supplies the transaction, so
    /// this job row co-commits with whatever else the caller writes in it.
    pub async fn enqueue_in_tx<'c>(
        &self,
        tx: &mut Transaction<'c, Postgres>,
        kind: &str,
        args: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobQueueError> {
        let definition = self
            .catalog
            .lookup(kind)
            .map_err(|_| JobQueueError::UnknownTask(kind.to_string()))?;

        let queue = match &options.queue {
            Some(name) => name.clone(),
            None => definition.queue_resolver.resolve(&args)?,
        };

        let fingerprint = definition.uniqueness_policy.as_ref().map(|policy| {
            compute_fingerprint(kind, &args, policy, options.unique_key.as_deref())
        });

        if let (Some(fp), Some(policy)) = (&fingerprint, &definition.uniqueness_policy) {
            if let Some(existing) = find_active_by_fingerprint(tx, fp, policy).await? {
                return Ok(EnqueueOutcome {
                    job_id: existing,
                    new: false,
                });
            }
        }

        let priority = match options.priority {
            Some(raw) => clamp_priority(Some(raw)),
            None => definition.default_priority as i16,
        };
        let max_attempts = options.max_attempts.unwrap_or(definition.default_max_attempts);
        let scheduled_at = options.scheduled_at.unwrap_or_else(Utc::now);
        let state = if scheduled_at > Utc::now() { "scheduled" } else { "available" };

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (kind, args, queue, priority, state, max_attempts, scheduled_at, unique_key, fingerprint, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (fingerprint) WHERE fingerprint IS NOT NULL
                AND state NOT IN ('completed', 'discarded', 'cancelled')
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(kind)
        .bind(&args)
        .bind(&queue)
        .bind(priority)
        .bind(state)
        .bind(max_attempts)
        .bind(scheduled_at)
        .bind(&options.unique_key)
        .bind(&fingerprint)
        .bind(&options.tags)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(row) => Ok(EnqueueOutcome {
                job_id: row.get("id"),
                new: true,
            }),
            None => {
                // Lost the race to a concurrent enqueue with the same
                // fingerprint; the winner's row must now be visible.
                let fp = fingerprint.expect("ON CONFLICT only fires for a non-null fingerprint");
                let policy = definition
                    .uniqueness_policy
                    .as_ref()
                    .expect("a fingerprint was computed, so a uniqueness policy exists");
                let existing = find_active_by_fingerprint(tx, &fp, policy)
                    .await?
                    .ok_or_else(|| JobQueueError::UniquenessConflict { job_id: -1 })?;
                Ok(EnqueueOutcome {
                    job_id: existing,
                    new: false,
                })
            }
        }
    }

    /// `EnqueueWithWork` (spec §6.2): runs `work` against the same
    /// transaction the job row is inserted in, so either both the caller's
    /// writes and the job become visible, or neither does (spec §8
    /// "transactional enqueue rollback").
    pub async fn enqueue_with_work<T, F>(
        &self,
        kind: &str,
        args: serde_json::Value,
        options: EnqueueOptions,
        work: F,
    ) -> Result<(T, EnqueueOutcome), JobQueueError>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, anyhow::Result<T>>,
    {
        let mut tx = self.store.pool().begin().await?;
        let work_result = work(&mut tx).await.map_err(JobQueueError::Work)?;
        let outcome = self.enqueue_in_tx(&mut tx, kind, args, options).await?;
        tx.commit().await?;
        Ok((work_result, outcome))
    }

    /// Marks the row `cancelled`. A locally in-flight attempt keeps running
    /// until its handler checks cancellation or the lease reaper reclaims
    /// it; `PgJobQueue` does not retain a `Scheduler` handle to signal it
    /// immediately (spec §6.2: cancel is "eventually stops", not "stops now").
    pub async fn cancel(&self, job_id: i64) -> anyhow::Result<bool> {
        self.store.cancel(job_id).await
    }

    pub async fn stats(&self, queue: Option<&str>) -> anyhow::Result<QueueStats> {
        self.store.stats(queue).await
    }

    pub async fn health(&self) -> anyhow::Result<bool> {
        self.store.health().await
    }

    pub async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        fetch_job(self.store.pool(), job_id).await
    }
}

/// Finds the active row (if any) this fingerprint currently collapses
/// onto, honoring `policy.by_state` (which states count as "still active")
/// and `policy.by_period` (how far back a row may be and still count),
/// not just "any non-terminal row" (spec §4.7).
async fn find_active_by_fingerprint(
    tx: &mut Transaction<'_, Postgres>,
    fingerprint: &str,
    policy: &UniquenessPolicy,
) -> Result<Option<i64>, JobQueueError> {
    let states: Vec<&'static str> = policy.by_state.iter().map(|state| state.as_str()).collect();
    let cutoff = policy
        .by_period
        .map(|period| Utc::now() - chrono::Duration::from_std(period).unwrap_or_default());

    let row = sqlx::query(
        r#"
        SELECT id FROM jobs
        WHERE fingerprint = $1
          AND state = ANY($2)
          AND ($3::timestamptz IS NULL OR created_at >= $3)
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(fingerprint)
    .bind(&states)
    .bind(cutoff)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|r| r.get("id")))
}

async fn discover_dynamic_queues(
    store: Arc<PgJobStore>,
    scheduler: Arc<Scheduler<PgJobStore>>,
    running: RunningScheduler,
    known_queues: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(100)));
    loop {
        ticker.tick().await;
        let Ok(queues) = store.list_queues().await else {
            continue;
        };
        for queue in queues {
            let is_new = {
                let mut known = known_queues.lock().unwrap();
                known.insert(queue.clone())
            };
            if is_new {
                info!(queue = %queue, "discovered dynamically-routed queue, starting fetch loop");
                let handle = scheduler.spawn_fetch_loop(queue);
                running.adopt(handle);
            }
        }
    }
}

#[async_trait::async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, spec: JobSpec, payload: serde_json::Value) -> Result<i64, SeesawError> {
        let options = EnqueueOptions {
            priority: spec.priority.map(u32::from),
            max_attempts: spec.max_attempts,
            scheduled_at: None,
            unique_key: spec.unique_key,
            tags: spec.tags,
            queue: spec.queue,
        };
        PgJobQueue::enqueue(self, &spec.kind, payload, options)
            .await
            .map(|outcome| outcome.job_id)
            .map_err(|err| SeesawError::Storage(err.into()))
    }
}
