//! PostgreSQL-backed implementation of the Seesaw durable job queue.
//!
//! This crate supplies the one concrete [`seesaw_core::job::JobStore`] the
//! framework ships with, plus [`PgJobQueue`], the facade applications
//! actually construct: it owns the connection pool, runs migrations, starts
//! the scheduler, and exposes the transactional enqueue calls a [`JobStore`]
//! alone cannot (co-committing a job row with the caller's own writes).
//!
//! # Database schema
//!
//! See `migrations/0001_create_jobs.sql`. In short: one `jobs` table keyed
//! by `BIGSERIAL id`, a `state` column matching
//! [`seesaw_core::job::JobState`]'s seven variants, and a partial unique
//! index on `fingerprint` for active rows backing the uniqueness policy
//! (spec §4.7).
//!
//! # Usage
//!
//! ```rust,ignore
//! use seesaw_core::job::{CommandRegistry, EnqueueOptions};
//! use seesaw_core::scheduler::SchedulerConfig;
//! use seesaw_job_postgres::PgJobQueue;
//! use sqlx::postgres::PgPoolOptions;
//! use std::sync::Arc;
//!
//! let pool = PgPoolOptions::new().connect("postgres://localhost/mydb").await?;
//! let catalog = Arc::new(CommandRegistry::new());
//! // catalog.register(...) for every task kind this process handles
//!
//! let queue = PgJobQueue::initialize(pool, catalog, SchedulerConfig::default()).await?;
//! queue.start();
//! queue.enqueue("deliver_event", payload, EnqueueOptions::default()).await?;
//! ```
//!
//! [`JobStore`]: seesaw_core::job::JobStore

mod error;
mod queue;
mod store;

pub use error::JobQueueError;
pub use queue::PgJobQueue;
pub use store::PgJobStore;
