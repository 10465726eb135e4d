//! Core types for LLM interaction.
//!
//! These types form the canonical, vendor-neutral model flowing between
//! callers, the tool loop and the vendor adapters.  The adapters in
//! [`super::anthropic`] and [`super::openai`] translate them into and out of
//! each vendor's wire format.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// The kind of binary attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Document,
    Image,
}

/// One unit of message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// A run of text.
    Text { text: String },

    /// A tool invocation requested by the model.
    ToolUse {
        /// Identifier assigned by the vendor for correlating results.
        id: String,
        /// The tool to invoke.
        name: String,
        /// Arguments as a JSON value, shaped by the tool's schema.
        arguments: Value,
    },

    /// The outcome of a tool invocation, fed back to the model.
    ToolResult {
        /// The [`Content::ToolUse`] id this result answers.
        tool_use_id: String,
        /// Serialized result content.
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// A binary document or image.
    Attachment {
        kind: AttachmentKind,
        media_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl Content {
    /// Create a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool-use block.
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Create a successful tool-result block.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Create an image attachment.
    pub fn image(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Attachment {
            kind: AttachmentKind::Image,
            media_type: media_type.into(),
            data,
        }
    }

    /// Create a document attachment.
    pub fn document(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Attachment {
            kind: AttachmentKind::Document,
            media_type: media_type.into(),
            data,
        }
    }

    /// The text of a [`Content::Text`] block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Serde helper: bytes as a base64 string.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the LLM.
    Assistant,
    /// Results of tool invocations, fed back to the model.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        })
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,
    /// Ordered content blocks.
    pub content: Vec<Content>,
}

impl Message {
    /// Create a message from explicit blocks.
    pub fn new(role: Role, content: Vec<Content>) -> Self {
        Self { role, content }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Content::text(text)])
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Content::text(text)])
    }

    /// Create an assistant text message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Content::text(text)])
    }

    /// Create a tool message carrying one or more results.
    pub fn tool_results(results: Vec<Content>) -> Self {
        Self::new(Role::Tool, results)
    }

    /// Concatenation of every text block.
    pub fn text(&self) -> String {
        self.content.iter().filter_map(Content::as_text).collect()
    }

    /// Every tool-use block in order.
    pub fn tool_uses(&self) -> Vec<ToolUseCall> {
        tool_uses_in(&self.content)
    }
}

/// A borrowed-free view of a [`Content::ToolUse`] block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

fn tool_uses_in(content: &[Content]) -> Vec<ToolUseCall> {
    content
        .iter()
        .filter_map(|c| match c {
            Content::ToolUse {
                id,
                name,
                arguments,
            } => Some(ToolUseCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// An ordered, append-only conversation.
///
/// At most one system message exists and it is always first.  Deserializing
/// goes through [`Conversation::from_messages`], so stored conversations are
/// normalized the same way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Message>", into = "Vec<Message>")]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored messages, normalizing the system message.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let mut conversation = Self::new();
        for message in messages {
            conversation.push(message);
        }
        conversation
    }

    /// Set the system prompt, replacing any existing one.
    pub fn set_system(&mut self, text: impl Into<String>) {
        self.replace_system(Message::system(text));
    }

    fn replace_system(&mut self, message: Message) {
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => *first = message,
            _ => self.messages.insert(0, message),
        }
    }

    /// The system prompt text, if any.
    pub fn system(&self) -> Option<String> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
    }

    /// Append a message.  A system message replaces the current one, content
    /// and all, instead of being appended.
    pub fn push(&mut self, message: Message) {
        if message.role == Role::System {
            self.replace_system(message);
        } else {
            self.messages.push(message);
        }
    }

    /// Append a user text message.
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Message::user(text));
    }

    /// All messages in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent message.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self::from_messages(messages)
    }
}

impl From<Conversation> for Vec<Message> {
    fn from(conversation: Conversation) -> Self {
        conversation.messages
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool definition, shared by vendor tool offers and MCP discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Chat request
// ---------------------------------------------------------------------------

/// A full request to send to an LLM provider.
///
/// Adapters only ever borrow it; once submitted it is not mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatParams {
    /// The model identifier, optionally vendor-prefixed
    /// (e.g. `"anthropic/claude-3-5-sonnet-20241022"`).
    pub model: String,

    /// Maximum tokens the model may generate in this turn.
    pub max_tokens: u32,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// The conversation history.
    pub messages: Vec<Message>,

    /// Tool definitions the model may invoke.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,

    /// Whether to use streaming SSE mode.
    pub stream: bool,
}

impl ChatParams {
    /// Create params with the default token budget and no tools.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            temperature: None,
            messages,
            tools: Vec::new(),
            stream: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

// ---------------------------------------------------------------------------
// Chat response
// ---------------------------------------------------------------------------

/// Why a model turn ended.
///
/// Vendor reasons are mapped onto the first four variants; anything else is
/// kept verbatim in [`StopReason::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Other(String),
}

impl StopReason {
    /// The canonical wire string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::ToolUse => "tool_use",
            Self::Other(raw) => raw,
        }
    }

    /// Parse a canonical string; unknown values are passed through.
    pub fn from_canonical(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            "tool_use" => Self::ToolUse,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StopReason {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Self::from_canonical(&raw))
    }
}

/// One candidate completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub role: Role,
    pub content: Vec<Content>,
    pub stop_reason: Option<StopReason>,
}

impl Choice {
    /// Convert into a conversation message.
    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

/// The canonical response from an LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatResponse {
    /// The first choice.
    pub fn primary(&self) -> Result<&Choice> {
        self.choices.first().ok_or_else(|| AgentError::EmptyResponse {
            vendor: self.model.clone(),
        })
    }

    /// Text of the primary choice (empty when there is none).
    pub fn text(&self) -> String {
        self.choices
            .first()
            .map(|c| c.content.iter().filter_map(Content::as_text).collect())
            .unwrap_or_default()
    }

    /// Tool-use blocks of the primary choice.
    pub fn tool_uses(&self) -> Vec<ToolUseCall> {
        self.choices
            .first()
            .map(|c| tool_uses_in(&c.content))
            .unwrap_or_default()
    }

    /// Stop reason of the primary choice.
    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.choices.first().and_then(|c| c.stop_reason.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Streaming events
// ---------------------------------------------------------------------------

/// Canonical incremental events decoded from a vendor stream.
///
/// Events are consumed once and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The message has started.
    MessageStart {
        id: String,
        model: String,
        role: Role,
        /// Usage known at start (input tokens for Anthropic).
        usage: Usage,
    },

    /// A new content block begins at `index`.  `block` is the empty shell
    /// (`Text` with no text, or `ToolUse` with `Null` arguments).
    ContentBlockStart { index: usize, block: Content },

    /// An incremental chunk for the block at `index`.
    ContentBlockDelta { index: usize, delta: StreamDelta },

    /// The block at `index` is complete.
    ContentBlockStop { index: usize },

    /// Message-level updates: stop reason and/or usage.
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },

    /// The message is complete.
    MessageStop,
}

/// Incremental delta within a streaming content block.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A chunk of text.
    Text(String),
    /// A chunk of JSON for a tool-use input.
    ToolInputJson(String),
}

// ---------------------------------------------------------------------------
// Usage tracking
// ---------------------------------------------------------------------------

/// Token usage and derived cost for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input (prompt).
    pub input_tokens: u64,
    /// Number of tokens generated by the model.
    pub output_tokens: u64,
    /// Input tokens served from the vendor's prompt cache.
    #[serde(default)]
    pub cached_tokens: u64,
    /// Cost in USD, derived from the pricing catalog.  Never sent by vendors.
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    /// Overlay the non-zero counters of `other` onto `self`.
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cached_tokens > 0 {
            self.cached_tokens = other.cached_tokens;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_system_replaces_instead_of_duplicating() {
        let mut conv = Conversation::new();
        conv.push_user("hi");
        conv.set_system("first");
        conv.set_system("second");

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.system().as_deref(), Some("second"));
        assert_eq!(conv.messages()[1].text(), "hi");
    }

    #[test]
    fn pushing_system_message_routes_to_front() {
        let conv = Conversation::from_messages(vec![
            Message::user("a"),
            Message::system("sys"),
            Message::assistant("b"),
        ]);
        let roles: Vec<_> = conv.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn deserializing_normalizes_system_messages() {
        let raw = json!([
            {"role": "system", "content": [{"type": "text", "text": "old"}]},
            {"role": "user", "content": [{"type": "text", "text": "hi"}]},
            {"role": "system", "content": [{"type": "text", "text": "new"}]},
        ]);
        let conv: Conversation = serde_json::from_value(raw).unwrap();

        let roles: Vec<_> = conv.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
        assert_eq!(conv.system().as_deref(), Some("new"));

        let back = serde_json::to_value(&conv).unwrap();
        assert_eq!(back.as_array().unwrap().len(), 2);
    }

    #[test]
    fn pushed_system_message_keeps_all_content() {
        let mut conv = Conversation::new();
        conv.push(Message::new(
            Role::System,
            vec![Content::text("look at this"), Content::image("image/png", vec![7])],
        ));

        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].content.len(), 2);
        assert_eq!(conv.system().as_deref(), Some("look at this"));
    }

    #[test]
    fn content_serializes_with_type_tag() {
        let v = serde_json::to_value(Content::tool_use("t1", "read", json!({"p": 1}))).unwrap();
        assert_eq!(v, json!({"type": "tool_use", "id": "t1", "name": "read", "arguments": {"p": 1}}));

        let v = serde_json::to_value(Content::tool_result("t1", "ok")).unwrap();
        assert!(v.get("is_error").is_none());
    }

    #[test]
    fn attachment_bytes_are_base64() {
        let img = Content::image("image/png", vec![0, 1, 2, 255]);
        let v = serde_json::to_value(&img).unwrap();
        assert_eq!(v["data"], "AAEC/w==");
        assert_eq!(v["kind"], "image");

        let back: Content = serde_json::from_value(v).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn stop_reason_passes_unknown_values_through() {
        let r: StopReason = serde_json::from_value(json!("refusal")).unwrap();
        assert_eq!(r, StopReason::Other("refusal".into()));
        assert_eq!(serde_json::to_value(&r).unwrap(), json!("refusal"));
        assert_eq!(StopReason::from_canonical("tool_use"), StopReason::ToolUse);
    }

    #[test]
    fn response_helpers_read_primary_choice() {
        let resp = ChatResponse {
            id: "r".into(),
            model: "m".into(),
            choices: vec![Choice {
                role: Role::Assistant,
                content: vec![
                    Content::text("Let me look. "),
                    Content::tool_use("t1", "read_file", json!({"path": "a"})),
                ],
                stop_reason: Some(StopReason::ToolUse),
            }],
            usage: Usage::default(),
        };
        assert_eq!(resp.text(), "Let me look. ");
        assert_eq!(resp.tool_uses().len(), 1);
        assert_eq!(resp.tool_uses()[0].name, "read_file");
        assert_eq!(resp.stop_reason(), Some(&StopReason::ToolUse));
    }

    #[test]
    fn empty_response_primary_is_error() {
        let resp = ChatResponse {
            id: "r".into(),
            model: "m".into(),
            choices: vec![],
            usage: Usage::default(),
        };
        assert!(matches!(resp.primary(), Err(AgentError::EmptyResponse { .. })));
    }

    #[test]
    fn usage_merge_keeps_known_counts() {
        let mut usage = Usage {
            input_tokens: 10,
            ..Usage::default()
        };
        usage.merge(&Usage {
            output_tokens: 7,
            ..Usage::default()
        });
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 7);
    }
}
