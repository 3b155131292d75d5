//! Error type for this backend. Kept separate from
//! [`seesaw_core::SeesawError`] so callers working directly against
//! `sqlx` (migrations, pool setup) see ordinary `sqlx::Error` wrapped with
//! context, while the `JobStore` trait methods return `anyhow::Result` as
//! the trait requires.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("no task definition registered for kind {0:?}")]
    UnknownTask(String),

    #[error("job {job_id} already has an active row for this uniqueness key")]
    UniquenessConflict { job_id: i64 },

    #[error("queue resolution failed: {0}")]
    QueueResolution(#[from] seesaw_core::error::SeesawError),

    #[error("work closure failed inside enqueue transaction: {0}")]
    Work(#[source] anyhow::Error),
}
