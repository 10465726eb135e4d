//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context (operation, vendor, status) to be logged as-is.

use uuid::Uuid;

use crate::llm::types::ChatResponse;
use crate::runtime::AgentOutcome;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The model identifier does not map to any known vendor.
    #[error("cannot resolve a provider for model `{model}`")]
    UnknownProvider { model: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Transport errors ----------------------------------------------------
    /// The HTTP request could not be completed (connect, timeout, body read).
    #[error("{vendor} request failed: {reason}")]
    Transport { vendor: String, reason: String },

    /// The operation was cancelled.  `partial` holds whatever had been
    /// accumulated from a stream before cancellation.
    #[error("{operation} cancelled")]
    Cancelled {
        operation: String,
        partial: Option<Box<ChatResponse>>,
    },

    // -- API errors ----------------------------------------------------------
    /// The vendor answered with a non-success status.
    #[error("{vendor} api returned {status}: {body}")]
    Api {
        vendor: String,
        status: u16,
        body: String,
    },

    /// The vendor answered successfully but with no choices or content.
    #[error("{vendor} returned an empty response")]
    EmptyResponse { vendor: String },

    // -- Decode errors -------------------------------------------------------
    /// A response or stream frame did not have the expected shape.
    #[error("{vendor} decode error: {reason}")]
    Decode { vendor: String, reason: String },

    /// The vendor reported an error in-band on an open stream.
    #[error("{vendor} stream error: {message}")]
    Stream { vendor: String, message: String },

    // -- Runtime errors ------------------------------------------------------
    /// The tool loop exceeded the maximum number of allowed turns.
    /// `partial` holds the responses and cost accrued before giving up.
    #[error("tool loop exceeded max turns ({max_turns}) for session {session_id}")]
    MaxTurnsExceeded {
        session_id: Uuid,
        max_turns: u32,
        partial: Box<AgentOutcome>,
    },

    /// A tool handler failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    // -- Upstream crate errors -----------------------------------------------
    /// An error from a tool server connection.
    #[error("mcp error: {0}")]
    Mcp(#[from] switchboard_mcp::McpError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Shorthand for a [`AgentError::Decode`] error.
    pub(crate) fn decode(vendor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            vendor: vendor.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors caused by bad configuration.  These are
    /// fatal and never retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::UnknownProvider { .. } | Self::MissingApiKey { .. }
        )
    }
}
