//! Line-framed JSON-RPC connection.
//!
//! One JSON value per line in both directions.  A reader task owns the
//! server's output stream, correlates responses with pending requests by id
//! and answers server-initiated requests with `method not found`.  Writes are
//! serialized through a mutex so concurrent callers never interleave lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::protocol::{
    Incoming, JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    METHOD_NOT_FOUND,
};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncRead + Send + Unpin>;
type PendingReply = oneshot::Sender<std::result::Result<Value, JsonRpcError>>;
type PendingMap = HashMap<u64, PendingReply>;

/// A JSON-RPC connection to a single server.
///
/// Owns an independent [`CancellationToken`]; cancelling it stops the reader
/// task and fails in-flight requests without touching other connections.
pub struct Connection {
    server: String,
    writer: Arc<Mutex<Option<Writer>>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    request_timeout: Option<Duration>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an already-open byte stream pair.
    ///
    /// `reader` is the server's output (the child's stdout); `writer` is its
    /// input (the child's stdin).
    pub fn new<R, W>(server: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let server = server.into();
        let writer: Writer = Box::new(writer);
        let writer = Arc::new(Mutex::new(Some(writer)));
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let reader_task = tokio::spawn(read_loop(
            server.clone(),
            Box::new(reader),
            writer.clone(),
            pending.clone(),
            cancel.clone(),
        ));

        Self {
            server,
            writer,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
            request_timeout: None,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// Fail any request that takes longer than `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The server name used in logs and errors.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The connection's cancellation scope.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` once the connection has been closed or cancelled.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.cancel.is_cancelled() {
            return Err(McpError::ConnectionClosed {
                server: self.server.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!(server = %self.server, id, method, "sending mcp request");
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let reply = async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(McpError::Cancelled {
                    server: self.server.clone(),
                    method: method.to_owned(),
                }),
                reply = rx => reply.map_err(|_| McpError::ConnectionClosed {
                    server: self.server.clone(),
                }),
            }
        };

        let outcome = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(McpError::Timeout {
                        server: self.server.clone(),
                        method: method.to_owned(),
                        timeout_ms: timeout.as_millis(),
                    });
                }
            },
            None => reply.await,
        };

        if outcome.is_err() {
            self.pending.lock().await.remove(&id);
        }

        outcome?.map_err(|e| McpError::Rpc {
            server: self.server.clone(),
            method: method.to_owned(),
            code: e.code,
            message: e.message,
        })
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        tracing::debug!(server = %self.server, method, "sending mcp notification");
        self.write_line(&line).await
    }

    /// Close the write half, cancel the scope and wait for the reader task.
    ///
    /// Idempotent.  Shutdown failures are logged and swallowed because the
    /// peer may already be gone.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.shutdown().await
        {
            tracing::debug!(server = %self.server, error = %e, "error closing mcp stdin");
        }

        self.cancel.cancel();

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        fail_pending(&self.pending).await;
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::ConnectionClosed {
            server: self.server.clone(),
        })?;
        write_framed(writer, line)
            .await
            .map_err(|source| McpError::Io {
                server: self.server.clone(),
                source,
            })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_framed(writer: &mut Writer, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Drop every pending sender so waiting requests observe `ConnectionClosed`.
async fn fail_pending(pending: &Mutex<PendingMap>) {
    pending.lock().await.clear();
}

async fn read_loop(
    server: String,
    reader: Reader,
    writer: Arc<Mutex<Option<Writer>>>,
    pending: Arc<Mutex<PendingMap>>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(server = %server, "mcp server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "mcp read error");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                // Servers sometimes log to stdout; skip anything that is not JSON.
                tracing::warn!(server = %server, error = %e, line = %trimmed, "ignoring non-json line from mcp server");
                continue;
            }
        };

        match Incoming::classify(value) {
            Some(Incoming::Response { id, outcome }) => {
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::warn!(server = %server, id, "response for unknown request id");
                    }
                }
            }
            Some(Incoming::Notification { method, params }) => {
                tracing::debug!(server = %server, method = %method, %params, "mcp notification");
            }
            Some(Incoming::Request { id, method }) => {
                tracing::debug!(server = %server, method = %method, "rejecting server-initiated request");
                let reply = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "error": {
                        "code": METHOD_NOT_FOUND,
                        "message": format!("method not supported by client: {method}"),
                    },
                });
                let mut guard = writer.lock().await;
                if let Some(w) = guard.as_mut()
                    && let Err(e) = write_framed(w, &reply.to_string()).await
                {
                    tracing::warn!(server = %server, error = %e, "failed to reject server request");
                }
            }
            None => {
                tracing::warn!(server = %server, line = %trimmed, "ignoring unrecognised json-rpc message");
            }
        }
    }

    cancel.cancel();
    fail_pending(&pending).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
