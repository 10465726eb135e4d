//! Anthropic Messages API adapter.
//!
//! The system prompt travels as a top-level `system` field, tool results are
//! `user` messages holding `tool_result` blocks, and attachments are base64
//! `source` blocks.  Streaming events map 1:1 onto [`StreamEvent`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::adapter::{
    Adapter, StreamHandler, embedded_error, error_frame, insert_header, join_url,
};
use crate::llm::sse::SseFrame;
use crate::llm::types::{
    AttachmentKind, ChatParams, ChatResponse, Choice, Content, Message, Role, StopReason,
    StreamDelta, StreamEvent, Tool, Usage,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default Anthropic API base URL.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic beta header required for OAuth token authentication.
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

const VENDOR: &str = "anthropic";

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for the Anthropic Messages API.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Adapter for AnthropicAdapter {
    fn vendor(&self) -> &str {
        VENDOR
    }

    fn endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "v1/messages")
    }

    /// Standard API keys use `x-api-key`; OAuth tokens (`sk-ant-oat...`) use
    /// bearer auth plus the OAuth beta header.
    fn auth_headers(&self, api_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if api_key.starts_with("sk-ant-oat") {
            insert_header(&mut headers, "authorization", &format!("Bearer {api_key}"))?;
            insert_header(&mut headers, "anthropic-beta", ANTHROPIC_OAUTH_BETA)?;
        } else {
            insert_header(&mut headers, "x-api-key", api_key)?;
        }
        insert_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION)?;
        insert_header(&mut headers, "content-type", "application/json")?;
        Ok(headers)
    }

    fn serialize(&self, params: &ChatParams) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&request_body(params))?)
    }

    fn deserialize(&self, body: &[u8]) -> Result<ChatResponse> {
        let v: Value = serde_json::from_slice(body)
            .map_err(|e| AgentError::decode(VENDOR, format!("invalid response json: {e}")))?;
        parse_response(&v)
    }

    fn stream_handler(&self) -> Box<dyn StreamHandler> {
        Box::new(AnthropicStreamHandler::default())
    }
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

/// Build the JSON body for the Messages API.
pub(crate) fn request_body(params: &ChatParams) -> Value {
    let (system, messages) = messages_to_anthropic(&params.messages);

    let mut body = json!({
        "model": params.model,
        "max_tokens": params.max_tokens,
        "messages": messages,
    });
    if let Some(system) = system {
        body["system"] = json!(system);
    }
    if let Some(temp) = params.temperature {
        body["temperature"] = json!(temp);
    }
    if !params.tools.is_empty() {
        body["tools"] = tools_to_anthropic(&params.tools);
    }
    if params.stream {
        body["stream"] = json!(true);
    }
    body
}

/// Split system messages out into one newline-joined string and convert the
/// rest to wire messages.
fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => {
                let text = msg.text();
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => system = Some(text),
                }
            }
            Role::User | Role::Tool => wire.push(json!({
                "role": "user",
                "content": msg.content.iter().map(content_to_anthropic).collect::<Vec<_>>(),
            })),
            Role::Assistant => wire.push(json!({
                "role": "assistant",
                "content": msg.content.iter().map(content_to_anthropic).collect::<Vec<_>>(),
            })),
        }
    }

    (system, wire)
}

fn content_to_anthropic(content: &Content) -> Value {
    match content {
        Content::Text { text } => json!({"type": "text", "text": text}),
        Content::ToolUse {
            id,
            name,
            arguments,
        } => {
            let input = if arguments.is_null() {
                json!({})
            } else {
                arguments.clone()
            };
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        Content::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut block = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                block["is_error"] = json!(true);
            }
            block
        }
        Content::Attachment {
            kind,
            media_type,
            data,
        } => {
            let block_type = match kind {
                AttachmentKind::Image => "image",
                AttachmentKind::Document => "document",
            };
            json!({
                "type": block_type,
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": STANDARD.encode(data),
                }
            })
        }
    }
}

fn tools_to_anthropic(tools: &[Tool]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

/// Parse a non-streaming Messages API response.
pub(crate) fn parse_response(v: &Value) -> Result<ChatResponse> {
    if v["type"] == "error" {
        return Err(AgentError::Stream {
            vendor: VENDOR.into(),
            message: error_message(v),
        });
    }

    let blocks = v["content"]
        .as_array()
        .ok_or_else(|| AgentError::decode(VENDOR, "missing `content` array in response"))?;

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                let text = block["text"].as_str().unwrap_or_default();
                if !text.is_empty() {
                    content.push(Content::text(text));
                }
            }
            Some("tool_use") => content.push(Content::tool_use(
                block["id"].as_str().unwrap_or_default(),
                block["name"].as_str().unwrap_or_default(),
                block["input"].clone(),
            )),
            other => tracing::debug!(block_type = ?other, "skipping content block"),
        }
    }

    if content.is_empty() {
        return Err(AgentError::EmptyResponse {
            vendor: VENDOR.into(),
        });
    }

    Ok(ChatResponse {
        id: v["id"].as_str().unwrap_or_default().to_owned(),
        model: v["model"].as_str().unwrap_or_default().to_owned(),
        choices: vec![Choice {
            role: Role::Assistant,
            content,
            stop_reason: v["stop_reason"].as_str().map(StopReason::from_canonical),
        }],
        usage: parse_usage(&v["usage"]),
    })
}

fn parse_usage(v: &Value) -> Usage {
    Usage {
        input_tokens: v["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: v["output_tokens"].as_u64().unwrap_or(0),
        cached_tokens: v["cache_read_input_tokens"].as_u64().unwrap_or(0),
        cost: 0.0,
    }
}

fn error_message(v: &Value) -> String {
    v["error"]["message"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| v["error"].to_string())
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Maps Anthropic stream events onto canonical events.
#[derive(Debug, Default)]
pub struct AnthropicStreamHandler {
    stopped: bool,
}

impl StreamHandler for AnthropicStreamHandler {
    fn handle(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        if frame.event.as_deref() == Some("error") {
            return Err(error_frame(VENDOR, &frame.data));
        }
        let v: Value = serde_json::from_str(&frame.data)
            .map_err(|e| AgentError::decode(VENDOR, format!("invalid event json: {e}")))?;
        if let Some(err) = embedded_error(VENDOR, &v) {
            return Err(err);
        }
        let event_type = frame
            .event
            .clone()
            .or_else(|| v["type"].as_str().map(str::to_owned))
            .unwrap_or_default();

        let index = || -> Result<usize> {
            v["index"]
                .as_u64()
                .map(|i| i as usize)
                .ok_or_else(|| AgentError::decode(VENDOR, format!("{event_type} without index")))
        };

        let events = match event_type.as_str() {
            "message_start" => {
                let message = &v["message"];
                vec![StreamEvent::MessageStart {
                    id: message["id"].as_str().unwrap_or_default().to_owned(),
                    model: message["model"].as_str().unwrap_or_default().to_owned(),
                    role: Role::Assistant,
                    usage: parse_usage(&message["usage"]),
                }]
            }

            "content_block_start" => {
                let block = &v["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => vec![StreamEvent::ContentBlockStart {
                        index: index()?,
                        block: Content::tool_use(
                            block["id"].as_str().unwrap_or_default(),
                            block["name"].as_str().unwrap_or_default(),
                            Value::Null,
                        ),
                    }],
                    Some("text") => {
                        let mut events = vec![StreamEvent::ContentBlockStart {
                            index: index()?,
                            block: Content::text(""),
                        }];
                        if let Some(text) = block["text"].as_str()
                            && !text.is_empty()
                        {
                            events.push(StreamEvent::ContentBlockDelta {
                                index: index()?,
                                delta: StreamDelta::Text(text.to_owned()),
                            });
                        }
                        events
                    }
                    // Thinking and server-side blocks keep their slot so
                    // later indices stay aligned; they stay empty.
                    other => {
                        tracing::debug!(block_type = ?other, "placeholder for unsupported block");
                        vec![StreamEvent::ContentBlockStart {
                            index: index()?,
                            block: Content::text(""),
                        }]
                    }
                }
            }

            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => vec![StreamEvent::ContentBlockDelta {
                        index: index()?,
                        delta: StreamDelta::Text(
                            delta["text"].as_str().unwrap_or_default().to_owned(),
                        ),
                    }],
                    Some("input_json_delta") => vec![StreamEvent::ContentBlockDelta {
                        index: index()?,
                        delta: StreamDelta::ToolInputJson(
                            delta["partial_json"].as_str().unwrap_or_default().to_owned(),
                        ),
                    }],
                    other => {
                        tracing::trace!(delta_type = ?other, "ignoring delta");
                        Vec::new()
                    }
                }
            }

            "content_block_stop" => vec![StreamEvent::ContentBlockStop { index: index()? }],

            "message_delta" => {
                let usage = v.get("usage").map(parse_usage);
                vec![StreamEvent::MessageDelta {
                    stop_reason: v["delta"]["stop_reason"]
                        .as_str()
                        .map(StopReason::from_canonical),
                    usage,
                }]
            }

            "message_stop" => {
                self.stopped = true;
                vec![StreamEvent::MessageStop]
            }

            "error" => {
                return Err(AgentError::Stream {
                    vendor: VENDOR.into(),
                    message: error_message(&v),
                });
            }

            other => {
                tracing::trace!(event = other, "ignoring stream event");
                Vec::new()
            }
        };

        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        if self.stopped {
            Ok(Vec::new())
        } else {
            Err(AgentError::decode(VENDOR, "stream ended before message_stop"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: Value) -> SseFrame {
        SseFrame {
            event: Some(event.to_owned()),
            data: data.to_string(),
        }
    }

    #[test]
    fn system_messages_merge_into_top_level_field() {
        let params = ChatParams::new(
            "claude-sonnet-4-20250514",
            vec![
                Message::system("You are helpful."),
                Message::system("Be brief."),
                Message::user("Hello"),
            ],
        );
        let body = request_body(&params);

        assert_eq!(body["system"], "You are helpful.\nBe brief.");
        assert_eq!(body["max_tokens"], 4096);
        assert!(body.get("stream").is_none());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"][0], json!({"type": "text", "text": "Hello"}));
    }

    #[test]
    fn tool_results_sent_as_user_blocks() {
        let params = ChatParams::new(
            "claude",
            vec![
                Message::user("Read test.txt"),
                Message::new(
                    Role::Assistant,
                    vec![Content::tool_use("tc_01", "read_file", json!({"path": "test.txt"}))],
                ),
                Message::tool_results(vec![Content::ToolResult {
                    tool_use_id: "tc_01".into(),
                    content: "nope".into(),
                    is_error: true,
                }]),
            ],
        );
        let body = request_body(&params);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["path"], "test.txt");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "tc_01");
        assert_eq!(messages[2]["content"][0]["is_error"], true);
    }

    #[test]
    fn attachments_become_base64_sources() {
        let params = ChatParams::new(
            "claude",
            vec![Message::new(
                Role::User,
                vec![
                    Content::image("image/png", vec![1, 2, 3]),
                    Content::document("application/pdf", b"%PDF".to_vec()),
                ],
            )],
        );
        let body = request_body(&params);
        let blocks = &body["messages"][0]["content"];
        assert_eq!(blocks[0]["type"], "image");
        assert_eq!(blocks[0]["source"]["data"], "AQID");
        assert_eq!(blocks[1]["type"], "document");
        assert_eq!(blocks[1]["source"]["media_type"], "application/pdf");
    }

    #[test]
    fn tools_and_stream_flag_encoded() {
        let params = ChatParams::new("claude", vec![Message::user("hi")])
            .with_tools(vec![Tool {
                name: "read_file".into(),
                description: "Read a file".into(),
                input_schema: json!({"type": "object"}),
            }])
            .with_stream(true);
        let body = request_body(&params);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn api_key_and_oauth_headers() {
        let adapter = AnthropicAdapter::new();
        let headers = adapter.auth_headers("sk-ant-api-123").unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant-api-123");
        assert_eq!(headers["anthropic-version"], "2023-06-01");

        let headers = adapter.auth_headers("sk-ant-oat-xyz").unwrap();
        assert_eq!(headers["authorization"], "Bearer sk-ant-oat-xyz");
        assert!(headers.get("x-api-key").is_none());
    }

    #[test]
    fn parse_tool_use_response() {
        let v = json!({
            "id": "msg_01",
            "type": "message",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "text", "text": "Let me read that."},
                {"type": "tool_use", "id": "toolu_01", "name": "read_file", "input": {"path": "a"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 9, "cache_read_input_tokens": 4}
        });
        let resp = parse_response(&v).unwrap();
        assert_eq!(resp.id, "msg_01");
        assert_eq!(resp.stop_reason(), Some(&StopReason::ToolUse));
        assert_eq!(resp.text(), "Let me read that.");
        assert_eq!(resp.tool_uses()[0].arguments, json!({"path": "a"}));
        assert_eq!(resp.usage.cached_tokens, 4);
    }

    #[test]
    fn empty_content_is_empty_response() {
        let v = json!({"id": "m", "content": [], "stop_reason": "end_turn", "usage": {}});
        assert!(matches!(parse_response(&v), Err(AgentError::EmptyResponse { .. })));

        let v = json!({"id": "m"});
        assert!(matches!(parse_response(&v), Err(AgentError::Decode { .. })));
    }

    #[test]
    fn stream_events_map_one_to_one() {
        let mut h = AnthropicStreamHandler::default();
        let ev = h
            .handle(&frame(
                "message_start",
                json!({"type": "message_start", "message": {"id": "m1", "model": "claude", "usage": {"input_tokens": 5}}}),
            ))
            .unwrap();
        assert!(matches!(&ev[0], StreamEvent::MessageStart { id, usage, .. } if id == "m1" && usage.input_tokens == 5));

        let ev = h
            .handle(&frame(
                "content_block_start",
                json!({"index": 1, "content_block": {"type": "tool_use", "id": "t1", "name": "read", "input": {}}}),
            ))
            .unwrap();
        assert_eq!(
            ev,
            vec![StreamEvent::ContentBlockStart {
                index: 1,
                block: Content::tool_use("t1", "read", Value::Null),
            }]
        );

        let ev = h
            .handle(&frame(
                "content_block_delta",
                json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}}),
            ))
            .unwrap();
        assert_eq!(
            ev,
            vec![StreamEvent::ContentBlockDelta {
                index: 1,
                delta: StreamDelta::ToolInputJson("{\"a\":".into()),
            }]
        );

        let ev = h
            .handle(&frame(
                "message_delta",
                json!({"delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 12}}),
            ))
            .unwrap();
        assert!(matches!(
            &ev[0],
            StreamEvent::MessageDelta { stop_reason: Some(StopReason::ToolUse), usage: Some(u) } if u.output_tokens == 12
        ));

        assert!(h.finish().is_err());
        let ev = h.handle(&frame("message_stop", json!({"type": "message_stop"}))).unwrap();
        assert_eq!(ev, vec![StreamEvent::MessageStop]);
        assert!(h.finish().unwrap().is_empty());
    }

    #[test]
    fn thinking_deltas_ignored() {
        let mut h = AnthropicStreamHandler::default();
        let ev = h
            .handle(&frame(
                "content_block_delta",
                json!({"index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
            ))
            .unwrap();
        assert!(ev.is_empty());
    }

    #[test]
    fn error_event_is_stream_error() {
        let mut h = AnthropicStreamHandler::default();
        let err = h
            .handle(&frame(
                "error",
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
            ))
            .unwrap_err();
        match err {
            AgentError::Stream { message, .. } => assert_eq!(message, "Overloaded"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn error_payload_without_event_line_is_stream_error() {
        let mut h = AnthropicStreamHandler::default();
        let err = h
            .handle(&SseFrame {
                event: None,
                data: json!({"error": {"type": "overloaded_error", "message": "Overloaded"}})
                    .to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::Stream { ref message, .. } if message == "Overloaded"));
    }

    #[test]
    fn plain_text_error_event_is_stream_error() {
        let mut h = AnthropicStreamHandler::default();
        let err = h
            .handle(&SseFrame {
                event: Some("error".into()),
                data: "upstream overloaded".into(),
            })
            .unwrap_err();
        assert!(
            matches!(err, AgentError::Stream { ref message, .. } if message == "upstream overloaded")
        );
    }

    #[test]
    fn block_events_require_index() {
        let mut h = AnthropicStreamHandler::default();
        let err = h
            .handle(&frame(
                "content_block_delta",
                json!({"delta": {"type": "text_delta", "text": "hi"}}),
            ))
            .unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));

        let err = h
            .handle(&frame("content_block_stop", json!({"type": "content_block_stop"})))
            .unwrap_err();
        assert!(err.to_string().contains("content_block_stop without index"));
    }
}
