//! MCP client bound to a tool-server child process.
//!
//! Lifecycle: [`McpClient::spawn`] launches the sidecar, [`McpClient::initialize`]
//! performs the handshake, and [`McpClient::close`] tears everything down.
//! Every other operation is rejected until the handshake has completed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::connection::Connection;
use crate::error::{McpError, Result};
use crate::pagination::{Page, fetch_all};
use crate::protocol::{
    CallToolResult, InitializeParams, InitializeResult, ListResourcesResult, ListToolsResult,
    MCP_PROTOCOL_VERSION, McpResource, McpTool, ReadResourceResult, ResourceContents,
};

/// How long `close` waits for the child to exit before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Launch spec for a tool server.
///
/// The command line is opaque to the client (e.g. `docker run --rm -i
/// <image>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Logical server name, used in logs and for tool namespacing.
    pub name: String,
    /// Executable to launch.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-request timeout in seconds; unset means wait indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Register this server's tools as `<name>__<tool>`.
    #[serde(default)]
    pub namespace_tools: bool,
}

impl McpServerConfig {
    /// Create a config for `command` with no arguments.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            request_timeout_secs: None,
            namespace_tools: false,
        }
    }

    /// Append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 client speaking MCP to one tool server.
pub struct McpClient {
    conn: Connection,
    child: Mutex<Option<Child>>,
    server_info: OnceLock<InitializeResult>,
}

impl McpClient {
    /// Launch the configured command and bind to its stdio.
    ///
    /// The child's stderr is forwarded to the log at debug level.
    pub fn spawn(config: &McpServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let missing_pipe = |pipe: &str| McpError::Spawn {
            server: config.name.clone(),
            source: std::io::Error::other(format!("child {pipe} was not captured")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "{line}");
                }
            });
        }

        tracing::info!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            pid = ?child.id(),
            "spawned mcp server"
        );

        let mut conn = Connection::new(config.name.clone(), stdout, stdin);
        if let Some(secs) = config.request_timeout_secs {
            conn = conn.with_request_timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            conn,
            child: Mutex::new(Some(child)),
            server_info: OnceLock::new(),
        })
    }

    /// Bind to an arbitrary byte-stream pair instead of a child process.
    pub fn from_io<R, W>(server: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            conn: Connection::new(server, reader, writer),
            child: Mutex::new(None),
            server_info: OnceLock::new(),
        }
    }

    /// The logical server name.
    pub fn name(&self) -> &str {
        self.conn.server()
    }

    /// Server identity and capabilities, once initialized.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    /// Returns `true` once the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.server_info.get().is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Perform the `initialize` handshake, then send
    /// `notifications/initialized`.
    ///
    /// Calling this again after success returns the cached result.
    pub async fn initialize(&self) -> Result<&InitializeResult> {
        if let Some(info) = self.server_info.get() {
            return Ok(info);
        }

        let params = serde_json::to_value(InitializeParams::default())?;
        let raw = self.conn.request("initialize", Some(params)).await?;
        let result: InitializeResult = self.decode("initialize", raw)?;

        if result.protocol_version != MCP_PROTOCOL_VERSION {
            tracing::warn!(
                server = %self.name(),
                requested = MCP_PROTOCOL_VERSION,
                negotiated = %result.protocol_version,
                "mcp server negotiated a different protocol version"
            );
        }

        self.conn.notify("notifications/initialized", None).await?;

        tracing::info!(
            server = %self.name(),
            server_name = %result.server_info.name,
            server_version = %result.server_info.version,
            "mcp server initialized"
        );

        Ok(self.server_info.get_or_init(|| result))
    }

    /// Send `exit`, close the pipes and reap the child.
    ///
    /// Never fails: the process may already be gone, so problems are logged.
    pub async fn close(&self) {
        if !self.conn.is_closed()
            && let Err(e) = self.conn.notify("exit", None).await
        {
            tracing::debug!(server = %self.name(), error = %e, "exit notification failed");
        }

        self.conn.close().await;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.name(), %status, "mcp server exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.name(), error = %e, "failed to reap mcp server");
                }
                Err(_) => {
                    tracing::warn!(server = %self.name(), "mcp server did not exit; killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(server = %self.name(), error = %e, "failed to kill mcp server");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.call("ping", None).await.map(|_| ())
    }

    /// Fetch one page of the tool catalog.
    pub async fn list_tools(&self, cursor: Option<String>) -> Result<Page<McpTool>> {
        let raw = self.call("tools/list", cursor_params(cursor)).await?;
        let page: ListToolsResult = self.decode("tools/list", raw)?;
        Ok(Page {
            items: page.tools,
            next_cursor: page.next_cursor,
        })
    }

    /// Fetch the whole tool catalog, following cursors.
    pub async fn list_all_tools(&self) -> Result<Vec<McpTool>> {
        fetch_all(self.name(), |cursor| self.list_tools(cursor)).await
    }

    /// Fetch one page of the resource catalog.
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<Page<McpResource>> {
        let raw = self.call("resources/list", cursor_params(cursor)).await?;
        let page: ListResourcesResult = self.decode("resources/list", raw)?;
        Ok(Page {
            items: page.resources,
            next_cursor: page.next_cursor,
        })
    }

    /// Fetch the whole resource catalog, following cursors.
    pub async fn list_all_resources(&self) -> Result<Vec<McpResource>> {
        fetch_all(self.name(), |cursor| self.list_resources(cursor)).await
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let raw = self
            .call("resources/read", Some(json!({ "uri": uri })))
            .await?;
        let result: ReadResourceResult = self.decode("resources/read", raw)?;
        Ok(result.contents)
    }

    /// Invoke a tool and wait for its result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        tracing::debug!(server = %self.name(), tool = name, "calling mcp tool");
        let raw = self
            .call(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        self.decode("tools/call", raw)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_initialized() {
            return Err(McpError::NotInitialized {
                server: self.name().to_owned(),
            });
        }
        self.conn.request(method, params).await
    }

    fn decode<T: DeserializeOwned>(&self, method: &str, raw: Value) -> Result<T> {
        serde_json::from_value(raw).map_err(|e| McpError::Protocol {
            server: self.name().to_owned(),
            reason: format!("malformed `{method}` result: {e}"),
        })
    }
}

fn cursor_params(cursor: Option<String>) -> Option<Value> {
    cursor.map(|c| json!({ "cursor": c }))
}
