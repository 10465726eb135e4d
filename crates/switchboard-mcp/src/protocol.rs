//! JSON-RPC 2.0 envelopes and the MCP payload shapes the client consumes.
//!
//! The MCP specification version targeted is `2024-11-05`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// The MCP protocol version this client speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// The JSON-RPC version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Client name reported during the handshake.
pub const CLIENT_NAME: &str = "switchboard";

/// Client version reported during the handshake.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// Standard JSON-RPC error codes.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

// ---------------------------------------------------------------------------
// JSON-RPC envelopes
// ---------------------------------------------------------------------------

/// An outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// An outbound JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (negative numbers are reserved by JSON-RPC).
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message the server can put on its stdout.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A reply to one of our requests.
    Response {
        id: u64,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
    /// A server-to-client notification.
    Notification { method: String, params: Value },
    /// A server-to-client request; this client answers every one with
    /// [`METHOD_NOT_FOUND`].
    Request {
        id: Value,
        method: String,
    },
}

impl Incoming {
    /// Classify a decoded JSON line.
    ///
    /// Returns `None` for values that are not JSON-RPC objects or carry a
    /// response id this client could never have issued.
    pub fn classify(value: Value) -> Option<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return None,
        };

        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let id = obj.remove("id");

        match (method, id) {
            (Some(method), Some(id)) if !id.is_null() => Some(Self::Request { id, method }),
            (Some(method), _) => Some(Self::Notification {
                method,
                params: obj.remove("params").unwrap_or(Value::Null),
            }),
            (None, Some(id)) => {
                let id = response_id(&id)?;
                if let Some(err) = obj.remove("error").filter(|e| !e.is_null()) {
                    Some(Self::Response {
                        id,
                        outcome: Err(JsonRpcError::lenient(err)),
                    })
                } else {
                    Some(Self::Response {
                        id,
                        outcome: Ok(obj.remove("result").unwrap_or(Value::Null)),
                    })
                }
            }
            (None, None) => None,
        }
    }
}

/// Our request ids are integers; some servers echo them back as strings.
fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl JsonRpcError {
    /// Decode an error object, filling in whatever the server left out.
    pub fn lenient(raw: Value) -> Self {
        if let Ok(err) = serde_json::from_value::<JsonRpcError>(raw.clone()) {
            return err;
        }
        Self {
            code: raw["code"].as_i64().unwrap_or(INTERNAL_ERROR),
            message: raw["message"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("malformed error object: {raw}")),
            data: raw.get("data").cloned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Name/version pair exchanged during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_owned(),
            capabilities: serde_json::json!({ "roots": { "listChanged": false } }),
            client_info: Implementation {
                name: CLIENT_NAME.to_owned(),
                version: CLIENT_VERSION.to_owned(),
            },
        }
    }
}

/// The server's answer to `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The result of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate every text block, newline separated.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Resource { resource } => resource.text.as_deref(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A content block inside a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    #[serde(other)]
    Unsupported,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// A resource advertised by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// One page of `resources/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    pub resources: Vec<McpResource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The body of a resource: text or base64 blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

/// The result of `resources/read`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_without_null_params() {
        let req = JsonRpcRequest::new(7, "ping", None);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}));
    }

    #[test]
    fn classify_success_response() {
        let incoming = Incoming::classify(json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}}));
        match incoming {
            Some(Incoming::Response { id, outcome }) => {
                assert_eq!(id, 3);
                assert_eq!(outcome.unwrap()["ok"], true);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_error_response() {
        let incoming = Incoming::classify(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32602, "message": "bad params"}
        }));
        match incoming {
            Some(Incoming::Response { outcome: Err(e), .. }) => {
                assert_eq!(e.code, -32602);
                assert_eq!(e.message, "bad params");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_error_without_message_still_resolves() {
        let incoming = Incoming::classify(json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32000}}));
        match incoming {
            Some(Incoming::Response { id, outcome: Err(e) }) => {
                assert_eq!(id, 5);
                assert_eq!(e.code, -32000);
                assert!(e.message.contains("malformed error object"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_error_that_is_not_an_object() {
        let incoming = Incoming::classify(json!({"jsonrpc": "2.0", "id": 6, "error": "exploded"}));
        match incoming {
            Some(Incoming::Response { outcome: Err(e), .. }) => {
                assert_eq!(e.code, INTERNAL_ERROR);
                assert!(e.message.contains("exploded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_string_id_response() {
        let incoming = Incoming::classify(json!({"jsonrpc": "2.0", "id": "9", "result": {}}));
        assert!(matches!(incoming, Some(Incoming::Response { id: 9, .. })));
    }

    #[test]
    fn classify_notification_and_request() {
        let note = Incoming::classify(json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"p": 1}}));
        assert!(matches!(note, Some(Incoming::Notification { ref method, .. }) if method == "notifications/progress"));

        let req = Incoming::classify(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "sampling/createMessage"}));
        assert!(matches!(req, Some(Incoming::Request { ref method, .. }) if method == "sampling/createMessage"));
    }

    #[test]
    fn classify_rejects_non_objects() {
        assert!(Incoming::classify(json!([1, 2])).is_none());
        assert!(Incoming::classify(json!({"jsonrpc": "2.0"})).is_none());
    }

    #[test]
    fn tool_defaults_schema_when_missing() {
        let tool: McpTool = serde_json::from_value(json!({"name": "echo"})).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_none());
    }

    #[test]
    fn call_tool_result_text_joins_blocks() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "line two"},
                {"type": "audio", "data": "zz"}
            ]
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "line one\nline two");
    }
}
