//! Per-queue fetch loops, lease reaper, and scheduled sweeper (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::job::{CommandRegistry, JobStore};
use crate::worker::{self, CancellationHandle};

/// Tunables for one scheduler instance (spec §6.4: all configuration flows
/// through `Initialize`, never environment variables).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often each queue's fetch loop polls when otherwise idle.
    pub poll_interval: Duration,
    /// Minimum gap between fetches triggered by a worker becoming idle.
    pub fetch_cooldown: Duration,
    /// Extra time added to a task's timeout before a lease is considered
    /// abandoned (spec §4.4 "timeout + grace").
    pub lease_grace: Duration,
    /// How often the lease reaper and scheduled sweeper run.
    pub maintenance_interval: Duration,
    /// Concurrency cap per queue, used for queues with no explicit
    /// `max_workers` entry in `queue_concurrency`.
    pub default_max_workers: usize,
    /// Per-queue concurrency overrides (spec §3.3 `QueueDescriptor`).
    pub queue_concurrency: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            fetch_cooldown: Duration::from_millis(100),
            lease_grace: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5),
            default_max_workers: 10,
            queue_concurrency: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_workers_for(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .unwrap_or(self.default_max_workers)
    }
}

/// Owns one fetch loop per known queue plus the lease reaper and scheduled
/// sweeper. Construct with [`Scheduler::new`], then [`Scheduler::start`] to
/// spawn every loop; [`Scheduler::stop`] aborts them (spec §6.2 `Stop`
/// drains — callers that want a graceful drain should stop accepting new
/// work first and then wait on in-flight job counts via `Stats`).
pub struct Scheduler<S: JobStore> {
    store: Arc<S>,
    catalog: Arc<CommandRegistry>,
    config: SchedulerConfig,
    in_flight_cancellations: Arc<DashMap<i64, CancellationHandle>>,
}

/// Handle to a started scheduler: the spawned tasks, kept so `stop()` can
/// abort them. Shared behind a `Mutex` so a queue-discovery loop spawned
/// after `start()` (e.g. for dynamically-resolved queues like
/// `runs_<id>`, spec §4.2) can [`RunningScheduler::adopt`] its own fetch
/// loop into the same shutdown set.
#[derive(Clone)]
pub struct RunningScheduler {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RunningScheduler {
    /// Registers an externally-spawned task so `stop()` aborts it too.
    pub fn adopt(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn stop(self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(store: Arc<S>, catalog: Arc<CommandRegistry>, config: SchedulerConfig) -> Self {
        Self {
            store,
            catalog,
            config,
            in_flight_cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Per spec §4.4: the scheduler does not promote `running` rows on
    /// startup; the lease reaper's first sweep recovers jobs left running
    /// by a crashed prior instance. Calling `start` immediately schedules
    /// that first sweep, so this is automatic.
    pub fn start(&self, queues: Vec<String>) -> RunningScheduler {
        if !self.catalog.is_frozen() {
            warn!("starting scheduler with an unfrozen task catalog; freeze() during Initialize");
        }

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(maintenance_loop(
            self.store.clone(),
            self.config.clone(),
        )));

        for queue in queues {
            tasks.push(self.spawn_fetch_loop(queue));
        }

        RunningScheduler {
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    /// Spawns one queue's fetch loop. Exposed so a caller that discovers
    /// new queue names at runtime (dynamic resolvers, spec §4.2) can start
    /// a loop for a queue that did not exist when `start()` ran, then
    /// [`RunningScheduler::adopt`] the handle.
    pub fn spawn_fetch_loop(&self, queue: String) -> JoinHandle<()> {
        let max_workers = self.config.max_workers_for(&queue);
        tokio::spawn(fetch_loop(
            queue,
            self.store.clone(),
            self.catalog.clone(),
            self.config.clone(),
            self.in_flight_cancellations.clone(),
            max_workers,
        ))
    }

    /// Signals cancellation to a locally-running attempt, if this process
    /// holds its lease. Admin cancel must also mark the row `cancelled` in
    /// the store (callers should call [`JobStore::cancel`] alongside this).
    pub fn cancel_local(&self, job_id: i64) -> bool {
        if let Some(handle) = self.in_flight_cancellations.get(&job_id) {
            handle.cancel();
            true
        } else {
            false
        }
    }
}

async fn maintenance_loop<S: JobStore>(store: Arc<S>, config: SchedulerConfig) {
    let mut ticker = tokio::time::interval(config.maintenance_interval);
    loop {
        ticker.tick().await;
        match store.reap_expired_leases().await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "lease reaper reclaimed abandoned jobs"),
            Err(err) => warn!(error = %err, "lease reaper failed"),
        }
        match store.sweep_scheduled().await {
            Ok(0) => {}
            Ok(n) => debug!(promoted = n, "scheduled sweeper promoted jobs to available"),
            Err(err) => warn!(error = %err, "scheduled sweeper failed"),
        }
    }
}

async fn fetch_loop<S: JobStore>(
    queue: String,
    store: Arc<S>,
    catalog: Arc<CommandRegistry>,
    config: SchedulerConfig,
    in_flight_cancellations: Arc<DashMap<i64, CancellationHandle>>,
    max_workers: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_workers));
    let in_flight = Arc::new(AtomicI64::new(0));
    let mut ticker = tokio::time::interval(config.poll_interval);

    loop {
        ticker.tick().await;

        let available_slots = semaphore.available_permits();
        if available_slots == 0 {
            continue;
        }

        let lease = match estimate_lease(&catalog, config.lease_grace) {
            Some(lease) => lease,
            None => Duration::from_secs(60) + config.lease_grace,
        };

        let claimed = match store
            .claim_ready(&queue, available_slots as i64, lease)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(queue = %queue, error = %err, "fetch query failed");
                continue;
            }
        };

        for job in claimed {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let store = store.clone();
            let catalog = catalog.clone();
            let in_flight = in_flight.clone();
            let in_flight_cancellations = in_flight_cancellations.clone();

            in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _permit = permit;
                run_job(job, &store, &catalog, &in_flight_cancellations).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(config.fetch_cooldown).await;
    }
}

fn estimate_lease(catalog: &CommandRegistry, grace: Duration) -> Option<Duration> {
    catalog
        .list()
        .into_iter()
        .filter_map(|kind| catalog.lookup(&kind).ok())
        .map(|def| def.timeout + grace)
        .max()
}

async fn run_job<S: JobStore>(
    job: crate::job::ClaimedJob,
    store: &Arc<S>,
    catalog: &Arc<CommandRegistry>,
    in_flight_cancellations: &Arc<DashMap<i64, CancellationHandle>>,
) {
    let definition = match catalog.lookup(&job.kind) {
        Ok(def) => def,
        Err(err) => {
            warn!(job_id = job.id, kind = %job.kind, error = %err, "no task definition for claimed job");
            let _ = store
                .mark_failed(
                    job.id,
                    crate::job::JobFailure::permanent(format!(
                        "no task definition registered for kind {:?}",
                        job.kind
                    )),
                )
                .await;
            return;
        }
    };

    let (cancel_handle, cancellation) = CancellationHandle::new();
    in_flight_cancellations.insert(job.id, cancel_handle);

    debug!(job_id = job.id, kind = %job.kind, queue = %job.queue, attempt = job.attempt, "dispatching job to handler");

    let outcome = worker::run_attempt(&job, &definition.handler, definition.timeout, cancellation).await;

    in_flight_cancellations.remove(&job.id);

    match outcome {
        None => {
            if let Err(err) = store.mark_succeeded(job.id).await {
                warn!(job_id = job.id, error = %err, "failed to record job success");
            } else {
                debug!(job_id = job.id, kind = %job.kind, "job completed");
            }
        }
        Some(failure) => {
            if let Err(err) = store.mark_failed(job.id, failure).await {
                warn!(job_id = job.id, error = %err, "failed to record job failure");
            }
        }
    }
}
