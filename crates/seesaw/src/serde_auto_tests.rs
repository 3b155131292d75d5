//! Tests for automatic serde serialization of commands: commands only need
//! `#[derive(Serialize, Deserialize)]` plus [`crate::auto_serialize`] to
//! round-trip through the job queue's JSON payload column.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Command, ExecutionMode, JobSpec};
use crate::dispatch::{Dispatcher, JobQueue};
use crate::error::SeesawError;
use crate::auto_serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutoSerializeBackgroundCommand {
    task: String,
    user_id: Uuid,
}

impl Command for AutoSerializeBackgroundCommand {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Background
    }

    fn job_spec(&self) -> Option<JobSpec> {
        Some(JobSpec::new("auto:background"))
    }

    auto_serialize!();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutoSerializeScheduledCommand {
    reminder: String,
    run_at: DateTime<Utc>,
}

impl Command for AutoSerializeScheduledCommand {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Scheduled { run_at: self.run_at }
    }

    fn job_spec(&self) -> Option<JobSpec> {
        Some(JobSpec::new("auto:scheduled"))
    }

    auto_serialize!();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutoSerializeInlineCommand {
    action: String,
}

impl Command for AutoSerializeInlineCommand {
    // Inline is the default execution mode; nothing to override.
}

#[derive(Clone, Default)]
struct RecordingJobQueue {
    enqueued: Arc<Mutex<Vec<(JobSpec, serde_json::Value)>>>,
}

impl RecordingJobQueue {
    fn enqueued(&self) -> Vec<(JobSpec, serde_json::Value)> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for RecordingJobQueue {
    async fn enqueue(&self, spec: JobSpec, payload: serde_json::Value) -> Result<i64, SeesawError> {
        self.enqueued.lock().unwrap().push((spec, payload));
        Ok(1)
    }
}

#[tokio::test]
async fn background_command_auto_serializes_through_dispatch() {
    let queue = RecordingJobQueue::default();
    let dispatcher = Dispatcher::with_job_queue(Arc::new(()), Arc::new(queue.clone()));

    let user_id = Uuid::new_v4();
    dispatcher
        .dispatch(AutoSerializeBackgroundCommand {
            task: "send_email".to_string(),
            user_id,
        })
        .await
        .unwrap();

    let enqueued = queue.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].0.kind, "auto:background");
    assert_eq!(enqueued[0].1["task"], "send_email");
    assert_eq!(enqueued[0].1["user_id"], user_id.to_string());
}

#[tokio::test]
async fn scheduled_command_carries_run_at_as_a_tag() {
    let queue = RecordingJobQueue::default();
    let dispatcher = Dispatcher::with_job_queue(Arc::new(()), Arc::new(queue.clone()));

    let run_at = Utc::now() + chrono::Duration::hours(1);
    dispatcher
        .dispatch(AutoSerializeScheduledCommand {
            reminder: "meeting in 1 hour".to_string(),
            run_at,
        })
        .await
        .unwrap();

    let enqueued = queue.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].0.kind, "auto:scheduled");
    assert!(enqueued[0]
        .0
        .tags
        .iter()
        .any(|t| t.starts_with("scheduled_at=")));
    assert_eq!(enqueued[0].1["reminder"], "meeting in 1 hour");
}

#[tokio::test]
async fn inline_command_without_effect_is_reported_not_silently_dropped() {
    let queue = RecordingJobQueue::default();
    let dispatcher = Dispatcher::with_job_queue(Arc::new(()), Arc::new(queue));

    let err = dispatcher
        .dispatch(AutoSerializeInlineCommand {
            action: "log".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SeesawError::UnknownTask(_)));
}

#[test]
fn command_round_trips_through_json() {
    let original = AutoSerializeBackgroundCommand {
        task: "process".to_string(),
        user_id: Uuid::new_v4(),
    };

    let json = original.serialize_to_json().unwrap();
    let deserialized: AutoSerializeBackgroundCommand = serde_json::from_value(json).unwrap();

    assert_eq!(original.task, deserialized.task);
    assert_eq!(original.user_id, deserialized.user_id);
}
