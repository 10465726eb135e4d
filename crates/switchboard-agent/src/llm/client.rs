//! Multi-vendor LLM client.
//!
//! [`LlmClient`] ties dispatch, adapters and the HTTP transport together.
//! Callers hand it canonical [`ChatParams`] and get canonical responses or
//! event streams back, whichever vendor the model resolves to.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::dispatch::{ProviderDispatch, Resolved};
use crate::llm::streaming::{DEFAULT_STREAM_CAPACITY, EventStream, spawn_decoder};
use crate::llm::transport::{HttpRequest, HttpTransport};
use crate::llm::types::{ChatParams, ChatResponse};

/// Something that can answer chat requests.  Implemented by [`LlmClient`];
/// tests substitute scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One complete, non-streamed response.
    async fn send(&self, params: &ChatParams, cancel: &CancellationToken) -> Result<ChatResponse>;

    /// A stream of canonical events for one response.
    async fn stream(&self, params: &ChatParams, cancel: &CancellationToken)
    -> Result<EventStream>;
}

/// HTTP-backed client for every supported vendor.
pub struct LlmClient {
    dispatch: ProviderDispatch,
    transport: HttpTransport,
    stream_capacity: usize,
}

impl LlmClient {
    pub fn new(dispatch: ProviderDispatch, transport: HttpTransport) -> Self {
        Self {
            dispatch,
            transport,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }

    /// Bound on buffered stream events between decoder and consumer.
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity.max(1);
        self
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    pub fn dispatch(&self) -> &ProviderDispatch {
        &self.dispatch
    }

    /// Resolve the model and encode the request for its vendor.
    fn prepare(&self, params: &ChatParams, stream: bool) -> Result<(Resolved, HttpRequest)> {
        let resolved = self.dispatch.resolve(&params.model)?;
        let adapter = &resolved.adapter;

        let wire = ChatParams {
            model: resolved.model.clone(),
            stream,
            ..params.clone()
        };
        let body = adapter.serialize(&wire)?;
        let headers = adapter.auth_headers(&resolved.api_key)?;
        let url = adapter.endpoint(&resolved.base_url);

        let request = HttpRequest::post(adapter.vendor(), url, headers, body);
        Ok((resolved, request))
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn send(&self, params: &ChatParams, cancel: &CancellationToken) -> Result<ChatResponse> {
        let (resolved, request) = self.prepare(params, false)?;
        let body = self.transport.execute_bytes(&request, cancel).await?;
        let response = resolved.adapter.deserialize(&body)?;

        tracing::debug!(
            vendor = %resolved.vendor,
            model = %resolved.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "LLM response decoded"
        );
        Ok(response)
    }

    async fn stream(
        &self,
        params: &ChatParams,
        cancel: &CancellationToken,
    ) -> Result<EventStream> {
        let (resolved, request) = self.prepare(params, true)?;
        let response = self.transport.execute(&request, cancel).await?;

        tracing::debug!(vendor = %resolved.vendor, model = %resolved.model, "LLM stream opened");
        Ok(spawn_decoder(
            response.bytes_stream(),
            resolved.adapter.vendor(),
            resolved.adapter.stream_handler(),
            cancel.clone(),
            self.stream_capacity,
        ))
    }
}
