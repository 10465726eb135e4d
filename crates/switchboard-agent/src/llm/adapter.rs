//! The vendor adapter contract.
//!
//! An [`Adapter`] is a set of pure mapping functions between the canonical
//! types in [`super::types`] and one vendor's wire format.  HTTP, retries
//! and streaming plumbing live elsewhere and are shared by every adapter.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::sse::SseFrame;
use crate::llm::types::{ChatParams, ChatResponse, StreamEvent};

/// Mapping between canonical requests/responses and a vendor wire format.
pub trait Adapter: Send + Sync {
    /// Vendor name used in logs and error context.
    fn vendor(&self) -> &str;

    /// Full request URL for the given base URL.
    fn endpoint(&self, base_url: &str) -> String;

    /// Authentication and version headers for a request.
    fn auth_headers(&self, api_key: &str) -> Result<HeaderMap>;

    /// Encode a request body.
    fn serialize(&self, params: &ChatParams) -> Result<Vec<u8>>;

    /// Decode a complete (non-streamed) response body.
    fn deserialize(&self, body: &[u8]) -> Result<ChatResponse>;

    /// A fresh per-stream handler turning SSE frames into canonical events.
    fn stream_handler(&self) -> Box<dyn StreamHandler>;
}

/// Per-stream state machine from vendor SSE frames to [`StreamEvent`]s.
pub trait StreamHandler: Send {
    /// Handle one frame.  In-band vendor errors are returned as
    /// [`AgentError::Stream`].
    fn handle(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>>;

    /// Called once the frame decoder is exhausted.
    fn finish(&mut self) -> Result<Vec<StreamEvent>>;
}

/// The error carried by an `event: error` frame.  The payload is usually a
/// JSON error envelope but some gateways send plain text.
pub(crate) fn error_frame(vendor: &str, data: &str) -> AgentError {
    let message = match serde_json::from_str::<Value>(data) {
        Ok(v) => envelope_message(v.get("error").unwrap_or(&v)),
        Err(_) => data.trim().to_owned(),
    };
    AgentError::Stream {
        vendor: vendor.to_owned(),
        message,
    }
}

/// An in-band `"error"` member on an otherwise ordinary stream payload.
pub(crate) fn embedded_error(vendor: &str, v: &Value) -> Option<AgentError> {
    let err = v.get("error").filter(|e| !e.is_null())?;
    Some(AgentError::Stream {
        vendor: vendor.to_owned(),
        message: envelope_message(err),
    })
}

fn envelope_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        _ => err["message"]
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| err.to_string()),
    }
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Insert a header, mapping invalid values to a configuration error.
pub(crate) fn insert_header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<()> {
    let value = HeaderValue::from_str(value).map_err(|e| AgentError::Config {
        reason: format!("invalid value for header `{name}`: {e}"),
    })?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}
