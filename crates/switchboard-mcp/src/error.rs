//! MCP client error types.
//!
//! Every failure on a tool-server connection surfaces as an [`McpError`].
//! Variants carry the server name so a caller juggling several sidecars can
//! tell which one misbehaved without a stack walk.

/// Unified error type for the MCP client.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    // -- Lifecycle -----------------------------------------------------------
    /// The child process could not be launched.
    #[error("failed to spawn mcp server `{server}`: {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    /// A request other than `initialize` was issued before the handshake
    /// completed.
    #[error("mcp server `{server}` is not initialized (call `initialize` first)")]
    NotInitialized { server: String },

    /// The connection is gone: the child exited or its stdout closed.
    #[error("mcp server `{server}` closed the connection")]
    ConnectionClosed { server: String },

    /// The connection was cancelled locally.
    #[error("mcp request `{method}` to `{server}` was cancelled")]
    Cancelled { server: String, method: String },

    /// No response arrived within the configured request timeout.
    #[error("mcp request `{method}` to `{server}` timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u128,
    },

    // -- Protocol ------------------------------------------------------------
    /// The server answered with a JSON-RPC error object.
    #[error("mcp server `{server}` returned error {code} for `{method}`: {message}")]
    Rpc {
        server: String,
        method: String,
        code: i64,
        message: String,
    },

    /// The server sent something that does not follow the protocol.
    #[error("mcp protocol violation from `{server}`: {reason}")]
    Protocol { server: String, reason: String },

    // -- Plumbing ------------------------------------------------------------
    /// Writing to or reading from the child's pipes failed.
    #[error("mcp i/o error on `{server}`: {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the MCP crate.
pub type Result<T> = std::result::Result<T, McpError>;
