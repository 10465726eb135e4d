//! Tool-calling loop runtime.
//!
//! The [`Agent`] sends the session's conversation to the model.  When the
//! model answers with tool-use blocks, the matching handlers run and their
//! results are fed back.  This repeats until a response invokes no tools or
//! the turn limit is hit.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use switchboard_mcp::McpClient;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::client::ChatBackend;
use crate::llm::pricing::{PricingSource, priced_usage};
use crate::llm::streaming::{TextDeltaCallback, accumulate};
use crate::llm::types::{ChatParams, ChatResponse, Content, Message, Tool, ToolUseCall};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Tool handlers
// ---------------------------------------------------------------------------

/// A tool the model may invoke.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The definition offered to the model.
    fn definition(&self) -> Tool;

    /// Run the tool.  The returned string is fed back to the model verbatim.
    async fn call(&self, arguments: Value) -> Result<String>;
}

/// Exposes one tool of an MCP server as a [`ToolHandler`].
pub struct McpToolHandler {
    client: Arc<McpClient>,
    /// Name used on the server, which may differ from the exposed name.
    remote_name: String,
    definition: Tool,
}

impl McpToolHandler {
    pub fn new(client: Arc<McpClient>, remote_name: impl Into<String>, definition: Tool) -> Self {
        Self {
            client,
            remote_name: remote_name.into(),
            definition,
        }
    }
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    fn definition(&self) -> Tool {
        self.definition.clone()
    }

    async fn call(&self, arguments: Value) -> Result<String> {
        let result = self.client.call_tool(&self.remote_name, arguments).await?;
        if result.is_error {
            return Err(AgentError::ToolExecutionFailed {
                tool_name: self.definition.name.clone(),
                reason: result.text(),
            });
        }
        Ok(result.text())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-indexed tool handlers.  A later registration under the same name
/// replaces the earlier one.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Option<Arc<dyn ToolHandler>> {
        let name = handler.definition().name;
        let previous = self.handlers.insert(name.clone(), handler);
        if previous.is_some() {
            tracing::warn!(tool = %name, "tool name collision; later registration wins");
        }
        previous
    }

    /// Register every tool an initialized MCP server offers.  With
    /// `namespace`, tools are exposed as `<server>__<tool>`.
    pub async fn register_mcp_server(
        &mut self,
        client: Arc<McpClient>,
        namespace: bool,
    ) -> Result<usize> {
        let tools = client.list_all_tools().await?;
        let count = tools.len();

        for tool in tools {
            let exposed = if namespace {
                format!("{}__{}", client.name(), tool.name)
            } else {
                tool.name.clone()
            };
            let definition = Tool {
                name: exposed,
                description: tool.description.unwrap_or_default(),
                input_schema: tool.input_schema,
            };
            self.register(Arc::new(McpToolHandler::new(
                client.clone(),
                tool.name,
                definition,
            )));
        }

        tracing::info!(server = %client.name(), count, namespace, "registered MCP tools");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.handlers.get(name)
    }

    /// Definitions of every registered tool, ordered by name.
    pub fn definitions(&self) -> Vec<Tool> {
        self.handlers.values().map(|h| h.definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Configuration for the tool loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Maximum model round trips per run.
    pub max_turns: u32,

    /// Maximum tokens per response.
    pub max_tokens: u32,

    /// Optional temperature for sampling.
    pub temperature: Option<f32>,

    /// Stream responses instead of waiting for them whole.
    pub stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_tokens: 4096,
            temperature: None,
            stream: true,
        }
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// Every model response, in order, including intermediate tool-use turns.
    pub responses: Vec<ChatResponse>,
    /// Total USD cost of `responses`.
    pub cost: f64,
}

impl AgentOutcome {
    /// Text of the last response.
    pub fn final_text(&self) -> String {
        self.responses
            .last()
            .map(ChatResponse::text)
            .unwrap_or_default()
    }
}

/// Drives one session through the tool-calling loop.
pub struct Agent {
    backend: Arc<dyn ChatBackend>,
    session: Session,
    tools: ToolRegistry,
    config: AgentConfig,
    pricing: Option<Arc<dyn PricingSource>>,
    on_text: Option<TextDeltaCallback>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(backend: Arc<dyn ChatBackend>, session: Session) -> Self {
        Self {
            backend,
            session,
            tools: ToolRegistry::new(),
            config: AgentConfig::default(),
            pricing: None,
            on_text: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pricing(mut self, pricing: Arc<dyn PricingSource>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Receive streamed text deltas as they arrive.
    pub fn with_text_sink(mut self, on_text: TextDeltaCallback) -> Self {
        self.on_text = Some(on_text);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Append a user message and run the loop.
    pub async fn run_prompt(&mut self, text: impl Into<String>) -> Result<AgentOutcome> {
        self.session.push(Message::user(text));
        self.run().await
    }

    /// Run the loop over the current conversation.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::MaxTurnsExceeded`], carrying the outcome so far,
    /// if every turn requested tools.  Backend errors are propagated; tool errors are not.
    pub async fn run(&mut self) -> Result<AgentOutcome> {
        let session_id = self.session.id();
        let max_turns = self.config.max_turns;
        let tools = self.tools.definitions();
        let mut outcome = AgentOutcome::default();

        tracing::info!(
            session_id = %session_id,
            model = %self.session.model(),
            max_turns,
            tool_count = tools.len(),
            "starting tool loop"
        );

        for turn in 0..max_turns {
            let params = ChatParams {
                model: self.session.model().to_owned(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                messages: self.session.conversation().messages().to_vec(),
                tools: tools.clone(),
                stream: self.config.stream,
            };

            let mut response = self.complete(&params).await?;
            if let Some(pricing) = &self.pricing {
                response.usage = priced_usage(pricing.as_ref(), &params.model, &response.usage).await;
            }
            self.session.record_usage(&response.usage);
            outcome.cost += response.usage.cost;

            self.session.push(response.primary()?.to_message());
            let calls = response.tool_uses();
            outcome.responses.push(response);

            if calls.is_empty() {
                tracing::info!(session_id = %session_id, turns = turn + 1, "tool loop completed");
                return Ok(outcome);
            }

            tracing::debug!(
                session_id = %session_id,
                turn,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "model requested tools"
            );

            let (results, invoked) = self.apply_tool_results(&calls).await;
            if let Some(results) = results {
                self.session.push(results);
            }
            if invoked == 0 {
                tracing::info!(session_id = %session_id, turns = turn + 1, "no known tools requested; stopping");
                return Ok(outcome);
            }
        }

        tracing::warn!(session_id = %session_id, max_turns, cost = outcome.cost, "tool loop hit the turn limit");
        Err(AgentError::MaxTurnsExceeded {
            session_id,
            max_turns,
            partial: Box::new(outcome),
        })
    }

    async fn complete(&self, params: &ChatParams) -> Result<ChatResponse> {
        if params.stream {
            let mut stream = self.backend.stream(params, &self.cancel).await?;
            accumulate(&mut stream, self.on_text.as_ref(), &self.cancel).await
        } else {
            self.backend.send(params, &self.cancel).await
        }
    }

    /// Run the handlers for `calls` concurrently.
    ///
    /// Returns the `tool` message holding every result (or `None` when no
    /// call matched a handler) and the number of handlers invoked.  Unknown
    /// tools are skipped with a warning.  Handler failures become
    /// `{"error": ...}` results flagged `is_error`.
    pub async fn apply_tool_results(&self, calls: &[ToolUseCall]) -> (Option<Message>, usize) {
        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            match self.tools.get(&call.name) {
                Some(handler) => pending.push((call, handler.clone())),
                None => tracing::warn!(tool = %call.name, id = %call.id, "model requested unknown tool"),
            }
        }

        let invoked = pending.len();
        if invoked == 0 {
            return (None, 0);
        }

        let results = join_all(pending.into_iter().map(|(call, handler)| async move {
            tracing::debug!(tool = %call.name, id = %call.id, "executing tool");
            match handler.call(call.arguments.clone()).await {
                Ok(content) => Content::tool_result(&call.id, content),
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                    Content::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: json!({"error": e.to_string()}).to_string(),
                        is_error: true,
                    }
                }
            }
        }))
        .await;

        (Some(Message::tool_results(results)), invoked)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
