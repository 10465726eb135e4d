//! LLM integration layer.
//!
//! This module provides the interface between the agent runtime and large
//! language model vendors.  It is organized into:
//!
//! - [`types`] -- Canonical messages, content blocks, responses and events.
//! - [`adapter`] -- The vendor adapter contract.
//! - [`anthropic`] -- Anthropic Messages API adapter.
//! - [`openai`] -- OpenAI-compatible adapter (OpenAI, OpenRouter, Gemini, DeepSeek, Mistral, Meta).
//! - [`sse`] -- Incremental SSE frame decoder.
//! - [`streaming`] -- Event accumulation and the producer/consumer stream.
//! - [`transport`] -- HTTP transport with retries and middleware.
//! - [`dispatch`] -- Model identifier to vendor resolution and credentials.
//! - [`pricing`] -- LiteLLM-format price catalog.
//! - [`client`] -- [`LlmClient`] and the [`ChatBackend`] seam.

pub mod adapter;
pub mod anthropic;
pub mod client;
pub mod dispatch;
pub mod openai;
pub mod pricing;
pub mod sse;
pub mod streaming;
pub mod transport;
pub mod types;

// Re-export the most commonly used types for convenience.
pub use adapter::{Adapter, StreamHandler};
pub use anthropic::AnthropicAdapter;
pub use client::{ChatBackend, LlmClient};
pub use dispatch::{
    CredentialSource, EnvCredentials, ProviderDispatch, Resolved, StaticCredentials, Vendor,
};
pub use openai::OpenAiAdapter;
pub use pricing::{ModelCatalog, ModelMetadata, PricingSource};
pub use sse::{SseDecoder, SseFrame};
pub use streaming::{EventStream, MessageAccumulator, TextDeltaCallback, accumulate};
pub use transport::{HttpRequest, HttpTransport, Middleware, RateLimitSnapshot, RetryPolicy};
pub use types::{
    AttachmentKind, ChatParams, ChatResponse, Choice, Content, Conversation, Message, Role,
    StopReason, StreamDelta, StreamEvent, Tool, ToolUseCall, Usage,
};
