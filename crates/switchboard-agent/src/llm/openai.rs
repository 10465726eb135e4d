//! OpenAI-compatible Chat Completions adapter.
//!
//! One adapter serves every vendor exposing the `/chat/completions` shape:
//! OpenAI itself, OpenRouter, Gemini's compatibility endpoint, DeepSeek,
//! Mistral and self-hosted Meta models.  The vendor only changes error
//! context, a few usage fields and whether streamed usage must be requested.
//!
//! OpenAI streams have no content-block events, so [`OpenAiStreamHandler`]
//! synthesizes them from `choices[0].delta` chunks.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::adapter::{
    Adapter, StreamHandler, embedded_error, error_frame, insert_header, join_url,
};
use crate::llm::dispatch::Vendor;
use crate::llm::sse::SseFrame;
use crate::llm::types::{
    AttachmentKind, ChatParams, ChatResponse, Choice, Content, Message, Role, StopReason,
    StreamDelta, StreamEvent, Tool, Usage,
};

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for OpenAI-shaped chat completion APIs.
#[derive(Debug, Clone, Copy)]
pub struct OpenAiAdapter {
    vendor: Vendor,
}

impl OpenAiAdapter {
    pub fn new(vendor: Vendor) -> Self {
        Self { vendor }
    }

    /// Whether the vendor accepts `stream_options.include_usage`.
    fn supports_stream_usage(&self) -> bool {
        !matches!(self.vendor, Vendor::Mistral | Vendor::Meta)
    }
}

impl Adapter for OpenAiAdapter {
    fn vendor(&self) -> &str {
        self.vendor.as_str()
    }

    fn endpoint(&self, base_url: &str) -> String {
        join_url(base_url, "chat/completions")
    }

    fn auth_headers(&self, api_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "authorization", &format!("Bearer {api_key}"))?;
        insert_header(&mut headers, "content-type", "application/json")?;
        Ok(headers)
    }

    fn serialize(&self, params: &ChatParams) -> Result<Vec<u8>> {
        let body = request_body(params, self.supports_stream_usage());
        Ok(serde_json::to_vec(&body)?)
    }

    fn deserialize(&self, body: &[u8]) -> Result<ChatResponse> {
        let v: Value = serde_json::from_slice(body).map_err(|e| {
            AgentError::decode(self.vendor.as_str(), format!("invalid response json: {e}"))
        })?;
        parse_response(self.vendor.as_str(), &v)
    }

    fn stream_handler(&self) -> Box<dyn StreamHandler> {
        Box::new(OpenAiStreamHandler::new(self.vendor.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

/// Build the JSON body for the Chat Completions API.
pub(crate) fn request_body(params: &ChatParams, stream_usage: bool) -> Value {
    let mut body = json!({
        "model": params.model,
        "max_tokens": params.max_tokens,
        "messages": messages_to_openai(&params.messages),
    });
    if let Some(temp) = params.temperature {
        body["temperature"] = json!(temp);
    }
    if !params.tools.is_empty() {
        body["tools"] = tools_to_openai(&params.tools);
    }
    if params.stream {
        body["stream"] = json!(true);
        if stream_usage {
            body["stream_options"] = json!({"include_usage": true});
        }
    }
    body
}

/// Convert canonical messages to the OpenAI wire format.
///
/// Every [`Content::ToolResult`] becomes its own `role: tool` message,
/// whatever role carried it.  Other content around the results keeps its
/// position; text riding on a tool-role message goes out as `user`.
pub fn messages_to_openai(messages: &[Message]) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len());

    for msg in messages {
        let role = match msg.role {
            Role::Tool => Role::User,
            role => role,
        };
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();

        for content in &msg.content {
            match content {
                Content::Text { text } => parts.push(json!({"type": "text", "text": text})),
                Content::Attachment {
                    kind,
                    media_type,
                    data,
                } => {
                    let url = format!("data:{media_type};base64,{}", STANDARD.encode(data));
                    parts.push(match kind {
                        AttachmentKind::Image => {
                            json!({"type": "image_url", "image_url": {"url": url}})
                        }
                        AttachmentKind::Document => {
                            json!({"type": "file", "file": {"filename": "document", "file_data": url}})
                        }
                    });
                }
                Content::ToolUse {
                    id,
                    name,
                    arguments,
                } => {
                    let arguments = if arguments.is_null() {
                        "{}".to_owned()
                    } else {
                        arguments.to_string()
                    };
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments},
                    }));
                }
                Content::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    flush_segment(role, &mut parts, &mut tool_calls, &mut wire);
                    wire.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    }));
                }
            }
        }

        flush_segment(role, &mut parts, &mut tool_calls, &mut wire);
    }

    wire
}

/// Emit buffered parts and tool calls as one message, if there are any.
fn flush_segment(
    role: Role,
    parts: &mut Vec<Value>,
    tool_calls: &mut Vec<Value>,
    wire: &mut Vec<Value>,
) {
    if parts.is_empty() && tool_calls.is_empty() {
        return;
    }
    let mut m = json!({"role": role.to_string()});
    m["content"] = if parts.is_empty() {
        Value::Null
    } else {
        collapse_parts(std::mem::take(parts))
    };
    if !tool_calls.is_empty() {
        m["tool_calls"] = Value::Array(std::mem::take(tool_calls));
    }
    wire.push(m);
}

/// Text-only content goes out as a plain string; mixed content as parts.
fn collapse_parts(parts: Vec<Value>) -> Value {
    if parts.iter().all(|p| p["type"] == "text") {
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect();
        Value::String(text)
    } else {
        Value::Array(parts)
    }
}

/// OpenAI wraps each tool in `{"type": "function", "function": {...}}`.
pub fn tools_to_openai(tools: &[Tool]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

/// Map an OpenAI `finish_reason` onto a canonical stop reason.
pub fn map_finish_reason(raw: &str) -> StopReason {
    match raw {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        other => StopReason::Other(other.to_owned()),
    }
}

/// Parse a non-streaming Chat Completions response.
pub(crate) fn parse_response(vendor: &str, v: &Value) -> Result<ChatResponse> {
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        return Err(AgentError::Stream {
            vendor: vendor.into(),
            message: error_message(err),
        });
    }

    let raw_choices = v["choices"]
        .as_array()
        .ok_or_else(|| AgentError::decode(vendor, "missing `choices` array in response"))?;

    let mut choices = Vec::with_capacity(raw_choices.len());
    for choice in raw_choices {
        let message = &choice["message"];
        let mut content = Vec::new();

        let text = message_text(&message["content"]);
        if !text.is_empty() {
            content.push(Content::text(text));
        }
        if let Some(calls) = message["tool_calls"].as_array() {
            for tc in calls {
                let func = &tc["function"];
                let name = func["name"].as_str().unwrap_or_default();
                content.push(Content::tool_use(
                    tc["id"].as_str().unwrap_or_default(),
                    name,
                    parse_arguments(vendor, name, func["arguments"].as_str().unwrap_or_default())?,
                ));
            }
        }

        choices.push(Choice {
            role: Role::Assistant,
            content,
            stop_reason: choice["finish_reason"].as_str().map(map_finish_reason),
        });
    }

    if choices.first().is_none_or(|c| c.content.is_empty()) {
        return Err(AgentError::EmptyResponse {
            vendor: vendor.into(),
        });
    }

    Ok(ChatResponse {
        id: v["id"].as_str().unwrap_or_default().to_owned(),
        model: v["model"].as_str().unwrap_or_default().to_owned(),
        choices,
        usage: parse_usage(&v["usage"]),
    })
}

/// `content` is usually a string but some vendors return text parts.
fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect(),
        _ => String::new(),
    }
}

fn parse_arguments(vendor: &str, name: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        AgentError::decode(vendor, format!("invalid JSON in tool call `{name}` arguments: {e}"))
    })
}

fn parse_usage(v: &Value) -> Usage {
    let cached = v["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .or_else(|| v["prompt_cache_hit_tokens"].as_u64())
        .unwrap_or(0);
    Usage {
        input_tokens: v["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: v["completion_tokens"].as_u64().unwrap_or(0),
        cached_tokens: cached,
        cost: 0.0,
    }
}

fn error_message(err: &Value) -> String {
    err["message"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| err.to_string())
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Synthesizes canonical block events from OpenAI delta chunks.
///
/// A text block is opened on the first content delta and one tool block per
/// tool-call index.  All open blocks close when `finish_reason` arrives.
#[derive(Debug)]
pub struct OpenAiStreamHandler {
    vendor: String,
    started: bool,
    next_index: usize,
    text_block: Option<usize>,
    /// OpenAI tool-call index to canonical block index.
    tool_blocks: HashMap<u64, usize>,
    /// Open block indices in the order they were opened.
    open: Vec<usize>,
    stopped: bool,
}

impl OpenAiStreamHandler {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            started: false,
            next_index: 0,
            text_block: None,
            tool_blocks: HashMap::new(),
            open: Vec::new(),
            stopped: false,
        }
    }

    fn open_block(&mut self, block: Content, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.open.push(index);
        events.push(StreamEvent::ContentBlockStart { index, block });
        index
    }

    fn close_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        for index in self.open.drain(..) {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        self.text_block = None;
        self.tool_blocks.clear();
    }
}

impl StreamHandler for OpenAiStreamHandler {
    fn handle(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        if frame.event.as_deref() == Some("error") {
            return Err(error_frame(&self.vendor, &frame.data));
        }
        let v: Value = serde_json::from_str(&frame.data).map_err(|e| {
            AgentError::decode(&self.vendor, format!("invalid JSON in SSE data: {e}"))
        })?;
        if let Some(err) = embedded_error(&self.vendor, &v) {
            return Err(err);
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: v["id"].as_str().unwrap_or_default().to_owned(),
                model: v["model"].as_str().unwrap_or_default().to_owned(),
                role: Role::Assistant,
                usage: Usage::default(),
            });
        }

        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str()
            && !text.is_empty()
        {
            let index = match self.text_block {
                Some(index) => index,
                None => {
                    let index = self.open_block(Content::text(""), &mut events);
                    self.text_block = Some(index);
                    index
                }
            };
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: StreamDelta::Text(text.to_owned()),
            });
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for (position, tc) in calls.iter().enumerate() {
                let key = tc["index"].as_u64().unwrap_or(position as u64);
                let index = match self.tool_blocks.get(&key) {
                    Some(&index) => index,
                    None => {
                        let block = Content::tool_use(
                            tc["id"].as_str().unwrap_or_default(),
                            tc["function"]["name"].as_str().unwrap_or_default(),
                            Value::Null,
                        );
                        let index = self.open_block(block, &mut events);
                        self.tool_blocks.insert(key, index);
                        index
                    }
                };
                if let Some(args) = tc["function"]["arguments"].as_str()
                    && !args.is_empty()
                {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: StreamDelta::ToolInputJson(args.to_owned()),
                    });
                }
            }
        }

        let usage = v
            .get("usage")
            .filter(|u| u.is_object())
            .map(parse_usage);

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.close_blocks(&mut events);
            events.push(StreamEvent::MessageDelta {
                stop_reason: Some(map_finish_reason(reason)),
                usage,
            });
        } else if usage.is_some() {
            events.push(StreamEvent::MessageDelta {
                stop_reason: None,
                usage,
            });
        }

        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        if self.stopped {
            return Ok(Vec::new());
        }
        if !self.started {
            return Err(AgentError::decode(&self.vendor, "stream ended before any chunk"));
        }
        let mut events = Vec::new();
        self.close_blocks(&mut events);
        events.push(StreamEvent::MessageStop);
        self.stopped = true;
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
