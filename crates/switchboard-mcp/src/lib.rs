//! Model Context Protocol client for Switchboard.
//!
//! Tool servers run as child processes and speak JSON-RPC 2.0 over their
//! standard streams, one JSON value per line.  Each server gets its own
//! [`McpClient`] with an independent connection and cancellation scope, so
//! one sidecar dying never disturbs the others.
//!
//! ## Modules
//!
//! - [`protocol`] -- JSON-RPC envelopes and MCP payload types.
//! - [`connection`] -- Line-framed request/response correlation.
//! - [`client`] -- Handshake, tool and resource operations, shutdown.
//! - [`pagination`] -- Cursor-following helper for list operations.
//! - [`error`] -- MCP error types.

pub mod client;
pub mod connection;
pub mod error;
pub mod pagination;
pub mod protocol;

pub use client::{McpClient, McpServerConfig};
pub use connection::Connection;
pub use error::{McpError, Result};
pub use pagination::{Page, fetch_all};
pub use protocol::{
    CallToolResult, InitializeResult, McpResource, McpTool, ResourceContents, ToolContent,
};
