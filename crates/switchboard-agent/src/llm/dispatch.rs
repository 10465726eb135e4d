//! Provider dispatch: from a model identifier to a ready-to-use adapter.
//!
//! Identifiers look like `vendor/model` (`anthropic/claude-3-5-sonnet-20241022`,
//! `openrouter/meta-llama/llama-3.1-70b`).  When the first segment is not a
//! known vendor, the bare model name after the last `/` is classified by
//! family instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::llm::adapter::Adapter;
use crate::llm::anthropic::{ANTHROPIC_BASE_URL, AnthropicAdapter};
use crate::llm::openai::OpenAiAdapter;

// ---------------------------------------------------------------------------
// Vendor
// ---------------------------------------------------------------------------

/// Every vendor the dispatcher can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Anthropic,
    OpenAi,
    OpenRouter,
    Google,
    DeepSeek,
    Mistral,
    /// Self-hosted or third-party OpenAI-compatible server for Llama models.
    Meta,
}

impl Vendor {
    pub const ALL: [Vendor; 7] = [
        Vendor::Anthropic,
        Vendor::OpenAi,
        Vendor::OpenRouter,
        Vendor::Google,
        Vendor::DeepSeek,
        Vendor::Mistral,
        Vendor::Meta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Google => "google",
            Self::DeepSeek => "deepseek",
            Self::Mistral => "mistral",
            Self::Meta => "meta",
        }
    }

    /// Parse an explicit `vendor/` prefix (also used for config keys).
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "google" | "gemini" => Some(Self::Google),
            "deepseek" => Some(Self::DeepSeek),
            "mistral" => Some(Self::Mistral),
            "meta" => Some(Self::Meta),
            _ => None,
        }
    }

    /// Guess the vendor from a bare model name.
    pub fn classify(model: &str) -> Option<Self> {
        let name = model.to_ascii_lowercase();
        let family = [
            ("claude", Self::Anthropic),
            ("gpt", Self::OpenAi),
            ("o1", Self::OpenAi),
            ("o3", Self::OpenAi),
            ("gemini", Self::Google),
            ("mistral", Self::Mistral),
            ("llama", Self::Meta),
            ("deepseek", Self::DeepSeek),
        ];
        family
            .into_iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|(_, vendor)| vendor)
    }

    /// Built-in base URL.  `Meta` has none and must be configured.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some(ANTHROPIC_BASE_URL),
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::OpenRouter => Some("https://openrouter.ai/api/v1"),
            Self::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Self::DeepSeek => Some("https://api.deepseek.com/v1"),
            Self::Mistral => Some("https://api.mistral.ai/v1"),
            Self::Meta => None,
        }
    }

    /// Environment variable holding the vendor's API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::Google => "GEMINI_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
            Self::Mistral => "MISTRAL_API_KEY",
            Self::Meta => "META_API_KEY",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Where API keys come from.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self, vendor: Vendor) -> Option<String>;
}

/// Reads `<VENDOR>_API_KEY` from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn api_key(&self, vendor: Vendor) -> Option<String> {
        std::env::var(vendor.api_key_env())
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Fixed keys, for tests and keys taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<Vendor, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, vendor: Vendor, key: impl Into<String>) -> Self {
        self.keys.insert(vendor, key.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn api_key(&self, vendor: Vendor) -> Option<String> {
        self.keys.get(&vendor).cloned()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Outcome of resolving a model identifier.
#[derive(Clone)]
pub struct Resolved {
    pub vendor: Vendor,
    /// Model name as sent on the wire (vendor prefix stripped).
    pub model: String,
    pub adapter: Arc<dyn Adapter>,
    pub base_url: String,
    pub api_key: String,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Resolves model identifiers to adapters, base URLs and credentials.
pub struct ProviderDispatch {
    credentials: Arc<dyn CredentialSource>,
    base_urls: HashMap<Vendor, String>,
    api_keys: HashMap<Vendor, String>,
}

impl fmt::Debug for ProviderDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pinned: Vec<String> = self.api_keys.keys().map(Vendor::to_string).collect();
        pinned.sort();
        f.debug_struct("ProviderDispatch")
            .field("base_urls", &self.base_urls)
            .field("pinned_keys", &pinned)
            .finish_non_exhaustive()
    }
}

impl ProviderDispatch {
    /// Create a dispatcher using the given credential source.
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            credentials,
            base_urls: HashMap::new(),
            api_keys: HashMap::new(),
        }
    }

    /// Create a dispatcher reading keys from the environment.
    pub fn from_env() -> Self {
        Self::new(Arc::new(EnvCredentials))
    }

    /// Override a vendor's base URL.
    pub fn with_base_url(mut self, vendor: Vendor, url: impl Into<String>) -> Self {
        self.base_urls.insert(vendor, url.into());
        self
    }

    /// Pin a vendor's API key, taking precedence over the credential source.
    pub fn with_api_key(mut self, vendor: Vendor, key: impl Into<String>) -> Self {
        self.api_keys.insert(vendor, key.into());
        self
    }

    /// Resolve `model` to a vendor, adapter, base URL and key.
    pub fn resolve(&self, model: &str) -> Result<Resolved> {
        let (vendor, wire_model) = split_model(model)?;

        let base_url = self
            .base_urls
            .get(&vendor)
            .cloned()
            .or_else(|| vendor.default_base_url().map(str::to_owned))
            .ok_or_else(|| AgentError::Config {
                reason: format!("provider `{vendor}` has no default base url; configure one"),
            })?;

        let api_key = self
            .api_keys
            .get(&vendor)
            .cloned()
            .or_else(|| self.credentials.api_key(vendor))
            .ok_or_else(|| AgentError::MissingApiKey {
                provider: vendor.to_string(),
            })?;

        let adapter: Arc<dyn Adapter> = match vendor {
            Vendor::Anthropic => Arc::new(AnthropicAdapter::new()),
            other => Arc::new(OpenAiAdapter::new(other)),
        };

        tracing::debug!(%vendor, model = wire_model, %base_url, "resolved model");

        Ok(Resolved {
            vendor,
            model: wire_model.to_owned(),
            adapter,
            base_url,
            api_key,
        })
    }
}

/// Split an identifier into its vendor and the model name sent on the wire.
pub fn split_model(model: &str) -> Result<(Vendor, &str)> {
    let unknown = || AgentError::UnknownProvider {
        model: model.to_owned(),
    };

    if let Some((prefix, rest)) = model.split_once('/')
        && let Some(vendor) = Vendor::from_prefix(prefix)
    {
        if rest.is_empty() {
            return Err(unknown());
        }
        return Ok((vendor, rest));
    }

    let bare = model.rsplit('/').next().unwrap_or(model);
    let vendor = Vendor::classify(bare).ok_or_else(unknown)?;
    Ok((vendor, model))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch() -> ProviderDispatch {
        let mut creds = StaticCredentials::new();
        for vendor in Vendor::ALL {
            creds = creds.with_key(vendor, format!("key-{vendor}"));
        }
        ProviderDispatch::new(Arc::new(creds))
    }

    #[test]
    fn resolves_prefixed_anthropic_model() {
        let resolved = dispatch()
            .resolve("anthropic/claude-3-5-sonnet-20241022")
            .unwrap();
        assert_eq!(resolved.vendor, Vendor::Anthropic);
        assert_eq!(resolved.model, "claude-3-5-sonnet-20241022");
        assert_eq!(resolved.base_url, "https://api.anthropic.com");
        assert_eq!(resolved.adapter.vendor(), "anthropic");
        assert_eq!(
            resolved.adapter.endpoint(&resolved.base_url),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(resolved.api_key, "key-anthropic");
    }

    #[test]
    fn openrouter_keeps_nested_model_path() {
        let resolved = dispatch().resolve("openrouter/meta-llama/llama-3.1-70b").unwrap();
        assert_eq!(resolved.vendor, Vendor::OpenRouter);
        assert_eq!(resolved.model, "meta-llama/llama-3.1-70b");
        assert_eq!(
            resolved.adapter.endpoint(&resolved.base_url),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn gemini_prefix_is_google() {
        let resolved = dispatch().resolve("gemini/gemini-1.5-pro").unwrap();
        assert_eq!(resolved.vendor, Vendor::Google);
        assert_eq!(resolved.adapter.vendor(), "google");
    }

    #[test]
    fn bare_names_classified_by_family() {
        let cases = [
            ("claude-3-haiku", Vendor::Anthropic),
            ("gpt-4o", Vendor::OpenAi),
            ("o1-mini", Vendor::OpenAi),
            ("o3-mini", Vendor::OpenAi),
            ("gemini-2.0-flash", Vendor::Google),
            ("mistral-large-latest", Vendor::Mistral),
            ("deepseek-chat", Vendor::DeepSeek),
            ("some-host/claude-3-opus", Vendor::Anthropic),
        ];
        for (model, expected) in cases {
            let (vendor, wire) = split_model(model).unwrap();
            assert_eq!(vendor, expected, "{model}");
            assert_eq!(wire, model);
        }
    }

    #[test]
    fn unknown_model_is_config_error() {
        let err = dispatch().resolve("totally-unknown").unwrap_err();
        assert!(matches!(err, AgentError::UnknownProvider { .. }));
        assert!(err.is_config());

        assert!(dispatch().resolve("anthropic/").is_err());
    }

    #[test]
    fn meta_requires_configured_base_url() {
        let err = dispatch().resolve("llama-3.1-8b").unwrap_err();
        assert!(matches!(err, AgentError::Config { .. }));

        let resolved = dispatch()
            .with_base_url(Vendor::Meta, "http://localhost:8080/v1")
            .resolve("meta/llama-3.1-8b")
            .unwrap();
        assert_eq!(
            resolved.adapter.endpoint(&resolved.base_url),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn missing_key_is_reported() {
        let dispatch = ProviderDispatch::new(Arc::new(StaticCredentials::new()));
        let err = dispatch.resolve("gpt-4o").unwrap_err();
        match err {
            AgentError::MissingApiKey { provider } => assert_eq!(provider, "openai"),
            other => panic!("unexpected: {other}"),
        }

        let resolved = dispatch.with_api_key(Vendor::OpenAi, "pinned").resolve("gpt-4o").unwrap();
        assert_eq!(resolved.api_key, "pinned");
    }

    #[test]
    fn debug_redacts_key() {
        let resolved = dispatch().resolve("gpt-4o").unwrap();
        let shown = format!("{resolved:?}");
        assert!(!shown.contains("key-openai"));
    }

    #[test]
    fn debug_output_hides_pinned_keys() {
        let dispatch = dispatch()
            .with_api_key(Vendor::OpenAi, "sk-very-secret")
            .with_base_url(Vendor::OpenAi, "http://localhost:9000/v1");
        let printed = format!("{dispatch:?}");
        assert!(printed.contains("http://localhost:9000/v1"));
        assert!(printed.contains("openai"));
        assert!(!printed.contains("sk-very-secret"));
        assert!(!printed.contains("key-"));
    }
}
