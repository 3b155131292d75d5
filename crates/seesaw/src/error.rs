//! Error types shared across the coordination layer and the job queue core.

use std::fmt;

use thiserror::Error;

/// Top-level error type for everything that can go wrong inside Seesaw:
/// dispatch, effect execution, and the durable job queue.
#[derive(Debug, Error)]
pub enum SeesawError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid queue name {0:?}: {1}")]
    InvalidQueue(String, &'static str),

    #[error("invalid payload for task {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("uniqueness conflict: an active job already exists for this key")]
    UniquenessConflict { existing_job_id: i64 },

    #[error("payload could not be deserialized for task {kind}: {source}")]
    Deserialization {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("effect for command {command} failed: {source}")]
    EffectFailed {
        command: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("the job queue is shutting down")]
    ShuttingDown,
}

/// Category used to decide retry behavior without leaking handler-internal
/// error types across the worker runtime / retry engine boundary.
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

/// A coarse, loggable classification of a failure. Never carries the
/// original error value so it is safe to persist and to compare across
/// handler types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// Likely to succeed on a later attempt (network blip, lock timeout, ...).
    Retryable,
    /// Will never succeed no matter how many attempts remain.
    Permanent,
}

impl fmt::Display for SafeErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafeErrorCategory::Retryable => write!(f, "retryable"),
            SafeErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Raised by effects/handlers to report a failed command or job attempt
/// without losing the command's name for logging.
#[derive(Debug, Error)]
#[error("command {command} failed: {source}")]
pub struct CommandFailed {
    pub command: &'static str,
    #[source]
    pub source: anyhow::Error,
}

/// Outcome of running a batch of independent operations (used by admin
/// bulk-cancel and by test harnesses that drive many jobs at once).
#[derive(Debug, Default)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(T, SeesawError)>,
}

impl<T> BatchOutcome<T> {
    pub fn is_fully_successful(&self) -> bool {
        self.failed.is_empty()
    }
}
