//! Configuration passed to `Initialize`. Spec §6.4: no required environment
//! variables in the core — everything flows through explicit options so the
//! embedding application decides how (if at all) to source them from its
//! own environment/config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration for one job queue instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Postgres connection string. Ignored if the embedding application
    /// constructs its own `PgPool` and passes it to
    /// `seesaw_job_postgres::PgJobQueue::new` directly.
    pub database_url: Option<String>,
    /// Maximum pool connections when `database_url` is used to build the
    /// pool for you.
    pub max_connections: u32,
    /// Schema search_path to set on the pool, for multi-tenant deployments
    /// sharing one database.
    pub schema: Option<String>,
    pub poll_interval_ms: u64,
    pub fetch_cooldown_ms: u64,
    pub lease_grace_ms: u64,
    pub maintenance_interval_ms: u64,
    pub default_max_workers: usize,
    pub queue_max_workers: HashMap<String, usize>,
    /// Grace period given to in-flight handlers during `Stop` before they
    /// are abandoned to the lease reaper (spec §5 shutdown).
    pub shutdown_grace_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            schema: None,
            poll_interval_ms: 1_000,
            fetch_cooldown_ms: 100,
            lease_grace_ms: 10_000,
            maintenance_interval_ms: 5_000,
            default_max_workers: 10,
            queue_max_workers: HashMap::new(),
            shutdown_grace_ms: 30_000,
        }
    }
}

impl JobQueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_cooldown(&self) -> Duration {
        Duration::from_millis(self.fetch_cooldown_ms)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_millis(self.lease_grace_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn to_scheduler_config(&self) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            poll_interval: self.poll_interval(),
            fetch_cooldown: self.fetch_cooldown(),
            lease_grace: self.lease_grace(),
            maintenance_interval: self.maintenance_interval(),
            default_max_workers: self.default_max_workers,
            queue_concurrency: self.queue_max_workers.clone(),
        }
    }
}
