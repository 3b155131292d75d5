//! # HTTP Fetcher Demo
//!
//! Registers a `fetch_url` task backed by `reqwest`, enqueues a few URLs
//! through [`PgJobQueue`], and polls until the durable job queue has worked
//! through all of them. Shows the queue core end to end: catalog, durable
//! enqueue, scheduler-driven execution, retry on transient failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use seesaw_core::job::{CommandRegistry, EnqueueOptions, QueueResolver, TaskDefinition};
use seesaw_core::scheduler::SchedulerConfig;
use seesaw_core::worker::{Cancellation, HandlerError, JobMetadata, TypedHandler};
use seesaw_job_postgres::PgJobQueue;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;

#[derive(Debug, Serialize, Deserialize)]
struct FetchPayload {
    url: String,
}

async fn fetch_url(
    metadata: JobMetadata,
    _cancellation: Cancellation,
    payload: FetchPayload,
) -> Result<(), HandlerError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(HandlerError::permanent)?;

    let response = client
        .get(&payload.url)
        .send()
        .await
        .map_err(HandlerError::retryable)?;

    let status = response.status();
    if !status.is_success() {
        return Err(HandlerError::retryable(anyhow::anyhow!(
            "HTTP {status} fetching {}",
            payload.url
        )));
    }

    let body_len = response.text().await.map_err(HandlerError::retryable)?.len();
    println!(
        "job {} (attempt {}): fetched {} ({} bytes)",
        metadata.id, metadata.attempt, payload.url, body_len
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/seesaw".to_string());
    let pool = PgPoolOptions::new().max_connections(5).connect(&database_url).await?;

    let catalog = Arc::new(CommandRegistry::new());
    catalog.register(
        TaskDefinition::new(
            "fetch_url",
            QueueResolver::static_name("http_fetch"),
            Arc::new(TypedHandler::new("fetch_url", fetch_url)),
        )
        .with_max_attempts(3)
        .with_timeout(Duration::from_secs(15)),
    )?;

    let queue = PgJobQueue::initialize(pool, catalog, SchedulerConfig::default()).await?;
    queue.start();

    let urls = [
        "https://example.com",
        "https://httpbin.org/status/200",
        "https://httpbin.org/status/404",
    ];

    let mut job_ids = Vec::new();
    for url in urls {
        let outcome = queue
            .enqueue(
                "fetch_url",
                serde_json::json!({ "url": url }),
                EnqueueOptions::default(),
            )
            .await?;
        println!("enqueued {url} as job {}", outcome.job_id);
        job_ids.push(outcome.job_id);
    }

    // Poll until every enqueued job has finished (spec's job lifecycle is
    // async: enqueue returns immediately, the scheduler drives completion).
    loop {
        let mut all_done = true;
        for &job_id in &job_ids {
            if let Some(job) = queue.get_job(job_id).await? {
                if !job.state.is_terminal() {
                    all_done = false;
                }
            }
        }
        if all_done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for &job_id in &job_ids {
        if let Some(job) = queue.get_job(job_id).await? {
            println!("job {} finished as {}", job.id, job.state);
        }
    }

    queue.stop();
    Ok(())
}
