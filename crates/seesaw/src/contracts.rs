//! External collaborator interfaces (spec §6.1). These are contracts only
//! — "some handler implementations in the source are stubs that return
//! 'not implemented'; the spec defines their contract, not their business
//! logic" (spec §9). No production implementation lives in this crate;
//! applications provide one and register a [`crate::worker::TaskHandler`]
//! that calls it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Indexes (or re-indexes) an endpoint from some external source.
#[async_trait]
pub trait EndpointIndexer: Send + Sync + 'static {
    async fn index_endpoint(
        &self,
        request: IndexEndpointRequest,
    ) -> anyhow::Result<IndexEndpointResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEndpointRequest {
    pub endpoint_id: String,
    pub source: String,
    pub reason: String,
    pub source_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEndpointResponse {
    pub index_id: String,
    pub stats: serde_json::Value,
}

/// Sends one transactional/notification email.
#[async_trait]
pub trait EmailSender: Send + Sync + 'static {
    async fn send_email(&self, message: EmailMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Delivers a previously-recorded event to its destination(s).
#[async_trait]
pub trait EventDeliverer: Send + Sync + 'static {
    async fn deliver_event(&self, event_record_id: String) -> anyhow::Result<()>;
}

/// Invokes a registered dispatcher in response to an event.
#[async_trait]
pub trait DispatcherInvoker: Send + Sync + 'static {
    async fn invoke_dispatcher(
        &self,
        dispatcher_id: String,
        event_record_id: String,
    ) -> anyhow::Result<()>;
}

/// HTTP client surface to a remote endpoint. A `401` from the remote must
/// map to [`EndpointClientError::InvalidApiKey`] so callers can suppress
/// retry storms against a credential that will never succeed (spec §6.1).
#[async_trait]
pub trait EndpointClient: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), EndpointClientError>;
    async fn index_endpoint(
        &self,
        request: IndexEndpointRequest,
    ) -> Result<IndexEndpointResponse, EndpointClientError>;
    async fn deliver_event(&self, event_record_id: String) -> Result<(), EndpointClientError>;
    async fn execute_job_request(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, EndpointClientError>;
    async fn preprocess_run_request(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, EndpointClientError>;
    async fn initialize_trigger(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, EndpointClientError>;
    async fn deliver_http_source_request(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, EndpointClientError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointClientError {
    /// The remote reported the API key as invalid. Handlers should treat
    /// this as permanent, not retryable — retrying cannot fix a bad key.
    #[error("remote endpoint rejected the API key")]
    InvalidApiKey,
    #[error("remote endpoint reported an error: {message}")]
    Api { message: String, stack: Option<String> },
    #[error("transport error reaching remote endpoint: {0}")]
    Transport(#[from] anyhow::Error),
}
