//! # AI Summarizer Demo
//!
//! Registers a `summarize_text` task that calls the Anthropic API directly
//! via `reqwest`, then drives it through [`PgJobQueue`] the same way any
//! other durable job would run: enqueue, scheduler-claimed execution,
//! retry on a transient API error, permanent failure on a bad request.

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
struct SummarizePayload {
    text: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

enum AnthropicError {
    /// Transport failure, rate limit, or 5xx: worth another attempt.
    Retryable(anyhow::Error),
    /// A 4xx other than 429: the request itself is bad, retrying won't help.
    Permanent(anyhow::Error),
}

async fn call_anthropic(
    client: &reqwest::Client,
    api_key: &str,
    request: AnthropicRequest,
) -> Result<AnthropicResponse, AnthropicError> {
    let response = client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|e| AnthropicError::Retryable(e.into()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let err = anyhow::anyhow!("API error {status}: {body}");
        return if status.is_client_error() && status.as_u16() != 429 {
            Err(AnthropicError::Permanent(err))
        } else {
            Err(AnthropicError::Retryable(err))
        };
    }

    response
        .json()
        .await
        .map_err(|e| AnthropicError::Retryable(e.into()))
}

async fn summarize_text(
    metadata: JobMetadata,
    _cancellation: Cancellation,
    payload: SummarizePayload,
) -> Result<(), HandlerError> {
    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|e| HandlerError::permanent(anyhow::anyhow!("ANTHROPIC_API_KEY not set: {e}")))?;
    let client = reqwest::Client::new();

    let request = AnthropicRequest {
        model: "claude-3-5-sonnet-20241022".to_string(),
        max_tokens: 1024,
        messages: vec![Message {
            role: "user".to_string(),
            content: format!("Summarize this text in 2-3 sentences:\n\n{}", payload.text),
        }],
    };

    let response = call_anthropic(&client, &api_key, request).await.map_err(|e| match e {
        AnthropicError::Retryable(e) => HandlerError::retryable(e),
        AnthropicError::Permanent(e) => HandlerError::permanent(e),
    })?;

    let summary = response
        .content
        .first()
        .and_then(|c| c.text.clone())
        .unwrap_or_default();
    let tokens_used = response.usage.input_tokens + response.usage.output_tokens;

    println!(
        "job {} (attempt {}): summary ({tokens_used} tokens): {summary}",
        metadata.id, metadata.attempt
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
            "summarize_text",
            QueueResolver::static_name("ai_summarize"),
            Arc::new(TypedHandler::new("summarize_text", summarize_text)),
        )
        .with_max_attempts(5)
        .with_timeout(Duration::from_secs(30)),
    )?;

    let queue = PgJobQueue::initialize(pool, catalog, SchedulerConfig::default()).await?;
    queue.start();

    let text = r#"
        Rust is a multi-paradigm, general-purpose programming language that emphasizes
        performance, type safety, and concurrency. It enforces memory safety -- meaning that
        all references point to valid memory -- without a garbage collector. To simultaneously
        enforce memory safety and prevent data races, its "borrow checker" tracks the object
        lifetime of all references in a program during compilation.
    "#;

    let outcome = queue
        .enqueue(
            "summarize_text",
            serde_json::json!({ "text": text }),
            EnqueueOptions::default(),
        )
        .await?;
    println!("enqueued summarization as job {}", outcome.job_id);

    loop {
        if let Some(job) = queue.get_job(outcome.job_id).await? {
            if job.state.is_terminal() {
                println!("job {} finished as {}", job.id, job.state);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    queue.stop();
    Ok(())
}
