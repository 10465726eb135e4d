//! Multi-vendor LLM access and tool-calling runtime for Switchboard.
//!
//! Callers build canonical [`ChatParams`] once and send them to any
//! supported vendor.  The model identifier picks the vendor and the adapter
//! translates to and from its wire format.  On top of that, the [`Agent`]
//! runs a bounded tool-calling loop whose tools may live in MCP servers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐    ┌──────────────┐    ┌───────────────┐
//! │   Agent   │───>│  LlmClient   │───>│ HttpTransport │──> vendor API
//! │ (tool     │    │ dispatch +   │    │ retry +       │
//! │  loop)    │    │ adapters     │    │ middleware    │
//! └─────┬─────┘    └──────┬───────┘    └───────────────┘
//!       │                 │
//!       │          ┌──────┴───────┐
//!       │          │ SSE decoder  │──> EventStream ──> accumulate
//!       │          └──────────────┘
//!       │
//!       └──> ToolRegistry ──> MCP servers (stdio JSON-RPC)
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- Canonical types, vendor adapters, transport, streaming, pricing.
//! - [`runtime`] -- The tool loop, tool handlers and registry.
//! - [`session`] -- Conversation state and running usage totals.
//! - [`config`] -- TOML configuration.
//! - [`error`] -- Agent error types.

pub mod config;
pub mod error;
pub mod llm;
pub mod runtime;
pub mod session;

// Re-export the most commonly used types at the crate root.
pub use config::SwitchboardConfig;
pub use error::{AgentError, Result};
pub use llm::{
    ChatBackend, ChatParams, ChatResponse, Content, Conversation, EventStream, LlmClient,
    Message, ModelCatalog, PricingSource, ProviderDispatch, Role, StopReason, StreamEvent, Tool,
    Usage, Vendor,
};
pub use runtime::{Agent, AgentConfig, AgentOutcome, McpToolHandler, ToolHandler, ToolRegistry};
pub use session::{Session, SessionSnapshot, SessionTotals};
