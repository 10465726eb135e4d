//! File-based configuration.
//!
//! A single TOML document configures the agent loop, the HTTP transport,
//! the price catalog, per-vendor overrides and the MCP tool servers:
//!
//! ```toml
//! [agent]
//! model = "anthropic/claude-3-5-sonnet-20241022"
//! max_turns = 10
//!
//! [http]
//! request_timeout_secs = 120
//! max_retries = 3
//!
//! [pricing]
//! cache_path = "~/.cache/switchboard/prices.json"
//!
//! [providers.openrouter]
//! base_url = "http://localhost:8080/v1"
//!
//! [[mcp_servers]]
//! name = "files"
//! command = "docker"
//! args = ["run", "--rm", "-i", "mcp/filesystem"]
//! ```
//!
//! Every section and field is optional.  API keys normally come from the
//! environment; a `[providers.<name>] api_key` pins one explicitly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_mcp::McpServerConfig;

use crate::error::{AgentError, Result};
use crate::llm::dispatch::{ProviderDispatch, Vendor};
use crate::llm::pricing::{DEFAULT_CATALOG_URL, DEFAULT_REFRESH_INTERVAL, ModelCatalog};
use crate::llm::transport::{HttpTransport, RetryPolicy};
use crate::runtime::AgentConfig;

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub agent: AgentSection,
    pub http: HttpSection,
    pub pricing: PricingSection,
    /// Keyed by vendor prefix (`anthropic`, `openai`, `gemini`, ...).
    pub providers: BTreeMap<String, ProviderSection>,
    pub mcp_servers: Vec<McpServerConfig>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_turns: default_max_turns(),
            max_tokens: default_max_tokens(),
            temperature: None,
            stream: true,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    /// Deadline for a complete, non-streamed request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Longest silence tolerated between reads; bounds streams.
    #[serde(default = "default_read_idle_timeout_secs")]
    pub read_idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            read_idle_timeout_secs: default_read_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSection {
    /// Disable cost computation entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_catalog_url")]
    pub remote_url: String,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for PricingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_path: None,
            remote_url: default_catalog_url(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "anthropic/claude-3-5-sonnet-20241022".into()
}

fn default_max_turns() -> u32 {
    20
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_read_idle_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.into()
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_secs()
}

// ---------------------------------------------------------------------------
// Loading and conversion
// ---------------------------------------------------------------------------

impl SwitchboardConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), mcp_servers = config.mcp_servers.len(), "configuration loaded");
        Ok(config)
    }

    /// Loop settings for [`crate::runtime::Agent`].
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_turns: self.agent.max_turns,
            max_tokens: self.agent.max_tokens,
            temperature: self.agent.temperature,
            stream: self.agent.stream,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http.max_retries,
            initial_delay: Duration::from_millis(self.http.initial_backoff_ms),
            max_delay: Duration::from_millis(self.http.max_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    /// Build the shared HTTP transport.
    pub fn transport(&self) -> Result<HttpTransport> {
        let transport = HttpTransport::with_timeouts(
            Duration::from_secs(self.http.connect_timeout_secs),
            Duration::from_secs(self.http.read_idle_timeout_secs),
        )?;
        Ok(transport
            .with_request_timeout(Duration::from_secs(self.http.request_timeout_secs))
            .with_retry(self.retry_policy()))
    }

    /// Apply `[providers.*]` overrides on top of `dispatch`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] for a section naming no known vendor.
    pub fn apply_providers(&self, mut dispatch: ProviderDispatch) -> Result<ProviderDispatch> {
        for (name, section) in &self.providers {
            let vendor = Vendor::from_prefix(name).ok_or_else(|| AgentError::Config {
                reason: format!("unknown provider section [providers.{name}]"),
            })?;
            if let Some(url) = &section.base_url {
                dispatch = dispatch.with_base_url(vendor, url);
            }
            if let Some(key) = &section.api_key {
                dispatch = dispatch.with_api_key(vendor, key);
            }
        }
        Ok(dispatch)
    }

    /// The price catalog, or `None` when pricing is disabled.  Entries are
    /// not loaded yet.
    pub fn catalog(&self) -> Option<ModelCatalog> {
        if !self.pricing.enabled {
            return None;
        }
        let mut catalog = ModelCatalog::new()
            .with_remote_url(&self.pricing.remote_url)
            .with_refresh_interval(Duration::from_secs(self.pricing.refresh_interval_secs));
        if let Some(path) = &self.pricing.cache_path {
            catalog = catalog.with_cache_path(path);
        }
        Some(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::llm::dispatch::StaticCredentials;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SwitchboardConfig::from_toml_str("").unwrap();
        assert_eq!(config, SwitchboardConfig::default());
        assert_eq!(config.agent_config(), AgentConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn parses_every_section() {
        let config = SwitchboardConfig::from_toml_str(
            r#"
[agent]
model = "gpt-4o"
max_turns = 5
stream = false
system_prompt = "be terse"

[http]
max_retries = 0
read_idle_timeout_secs = 30

[pricing]
enabled = false

[providers.openrouter]
base_url = "http://localhost:9000/v1"
api_key = "sk-or-test"

[[mcp_servers]]
name = "files"
command = "docker"
args = ["run", "--rm", "-i", "mcp/filesystem"]
namespace_tools = true
"#,
        )
        .unwrap();

        assert_eq!(config.agent.model, "gpt-4o");
        assert_eq!(config.agent_config().max_turns, 5);
        assert!(!config.agent_config().stream);
        assert_eq!(config.agent.system_prompt.as_deref(), Some("be terse"));
        assert_eq!(config.retry_policy().max_retries, 0);
        assert_eq!(config.http.read_idle_timeout_secs, 30);
        assert_eq!(config.http.request_timeout_secs, 300);
        assert!(config.transport().is_ok());
        assert!(config.catalog().is_none());
        assert_eq!(config.mcp_servers.len(), 1);
        assert!(config.mcp_servers[0].namespace_tools);
        assert_eq!(config.mcp_servers[0].args.len(), 4);
    }

    #[test]
    fn provider_overrides_reach_dispatch() {
        let config = SwitchboardConfig::from_toml_str(
            r#"
[providers.openrouter]
base_url = "http://localhost:9000/v1"
api_key = "sk-or-test"
"#,
        )
        .unwrap();

        let dispatch = config
            .apply_providers(ProviderDispatch::new(Arc::new(StaticCredentials::new())))
            .unwrap();
        let resolved = dispatch.resolve("openrouter/meta-llama/llama-3-70b").unwrap();
        assert_eq!(resolved.base_url, "http://localhost:9000/v1");
        assert_eq!(resolved.api_key, "sk-or-test");
    }

    #[test]
    fn unknown_provider_section_is_rejected() {
        let config = SwitchboardConfig::from_toml_str("[providers.acme]\nbase_url = \"x\"").unwrap();
        let err = config
            .apply_providers(ProviderDispatch::new(Arc::new(StaticCredentials::new())))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(SwitchboardConfig::from_toml_str("[agent\nmodel=").unwrap_err().is_config());
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(&path, "[agent]\nmodel = \"deepseek/deepseek-chat\"\n").unwrap();

        let config = SwitchboardConfig::from_file(&path).unwrap();
        assert_eq!(config.agent.model, "deepseek/deepseek-chat");
    }
}
