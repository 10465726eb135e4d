//! Model pricing catalog.
//!
//! Prices are read from a LiteLLM-format JSON catalog: an object keyed by
//! model name whose values carry per-token costs and limits.  The catalog is
//! cached on disk and refreshed from a remote URL once it is older than the
//! configured refresh interval.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::llm::dispatch::split_model;
use crate::llm::types::Usage;

/// Public LiteLLM price list.
pub const DEFAULT_CATALOG_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";

/// Default age after which the cache file is refreshed.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// One catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub litellm_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_function_calling: Option<bool>,
}

impl ModelMetadata {
    /// Create an entry with only prices set.
    pub fn priced(input_cost_per_token: f64, output_cost_per_token: f64) -> Self {
        Self {
            input_cost_per_token,
            output_cost_per_token,
            ..Self::default()
        }
    }

    /// USD cost of `usage` at these prices.
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.input_tokens as f64 * self.input_cost_per_token
            + usage.output_tokens as f64 * self.output_cost_per_token
    }
}

/// Parse a LiteLLM catalog.  Entries that do not fit [`ModelMetadata`]
/// (such as the documentation-only `sample_spec`) are skipped.
pub fn parse_catalog(bytes: &[u8]) -> Result<HashMap<String, ModelMetadata>> {
    let raw: HashMap<String, Value> = serde_json::from_slice(bytes).map_err(|e| {
        AgentError::decode("pricing", format!("catalog is not a JSON object: {e}"))
    })?;

    let mut entries = HashMap::with_capacity(raw.len());
    for (model, value) in raw {
        match serde_json::from_value::<ModelMetadata>(value) {
            Ok(meta) => {
                entries.insert(model, meta);
            }
            Err(e) => tracing::trace!(%model, error = %e, "skipping catalog entry"),
        }
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// Injected capability for looking up model prices.
#[async_trait]
pub trait PricingSource: Send + Sync {
    /// Metadata for `model`, if known.
    async fn get(&self, model: &str) -> Option<ModelMetadata>;

    /// (Re)load the catalog.  Returns the number of entries.
    async fn load(&self) -> Result<usize>;

    /// Drop every loaded entry.
    async fn clear(&self);
}

/// Price `usage` for `model`.  Unknown models cost zero.
pub async fn priced_usage(source: &dyn PricingSource, model: &str, usage: &Usage) -> Usage {
    let mut usage = *usage;
    usage.cost = match source.get(model).await {
        Some(meta) => meta.cost(&usage),
        None => {
            tracing::debug!(model, "no pricing for model");
            0.0
        }
    };
    usage
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// File-cached, remotely refreshed price catalog.
pub struct ModelCatalog {
    entries: RwLock<HashMap<String, ModelMetadata>>,
    cache_path: Option<PathBuf>,
    remote_url: Option<String>,
    refresh_interval: Duration,
    http: reqwest::Client,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCatalog {
    /// An empty catalog with no sources.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache_path: None,
            remote_url: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            http: reqwest::Client::new(),
        }
    }

    /// A catalog preloaded with fixed entries.
    pub fn from_entries(entries: HashMap<String, ModelMetadata>) -> Self {
        Self {
            entries: RwLock::new(entries),
            ..Self::new()
        }
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Number of loaded entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn cache_age(path: &Path) -> Option<Duration> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let modified = meta.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    async fn read_cache(path: &Path) -> Result<HashMap<String, ModelMetadata>> {
        let bytes = tokio::fs::read(path).await?;
        parse_catalog(&bytes)
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        let transport = |e: reqwest::Error| AgentError::Transport {
            vendor: "pricing".into(),
            reason: e.to_string(),
        };
        let response = self.http.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Api {
                vendor: "pricing".into(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.bytes().await.map_err(transport)?.to_vec())
    }

    async fn write_cache(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %parent.display(), error = %e, "cannot create pricing cache dir");
            return;
        }
        if let Err(e) = tokio::fs::write(path, bytes).await {
            tracing::warn!(path = %path.display(), error = %e, "cannot write pricing cache");
        }
    }

    async fn store(&self, entries: HashMap<String, ModelMetadata>) -> usize {
        let count = entries.len();
        *self.entries.write().await = entries;
        count
    }

    /// Candidate keys for `model`: exact, bare, then `vendor/bare`.
    fn candidates(model: &str) -> Vec<String> {
        let bare = model.rsplit('/').next().unwrap_or(model);
        let mut keys = vec![model.to_owned()];
        if bare != model {
            keys.push(bare.to_owned());
        }
        if let Ok((vendor, _)) = split_model(model) {
            let prefixed = format!("{vendor}/{bare}");
            if !keys.contains(&prefixed) {
                keys.push(prefixed);
            }
        }
        keys
    }
}

#[async_trait]
impl PricingSource for ModelCatalog {
    async fn get(&self, model: &str) -> Option<ModelMetadata> {
        let entries = self.entries.read().await;
        Self::candidates(model)
            .iter()
            .find_map(|key| entries.get(key))
            .cloned()
    }

    async fn load(&self) -> Result<usize> {
        let cache_age = match &self.cache_path {
            Some(path) => Self::cache_age(path).await,
            None => None,
        };

        if let (Some(path), Some(age)) = (&self.cache_path, cache_age)
            && age < self.refresh_interval
        {
            match Self::read_cache(path).await {
                Ok(entries) => {
                    let count = self.store(entries).await;
                    tracing::debug!(path = %path.display(), count, "pricing loaded from cache");
                    return Ok(count);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "pricing cache unreadable"),
            }
        }

        let mut last_error = None;
        if let Some(url) = &self.remote_url {
            match self.fetch_remote(url).await {
                Ok(bytes) => match parse_catalog(&bytes) {
                    Ok(entries) => {
                        if let Some(path) = &self.cache_path {
                            Self::write_cache(path, &bytes).await;
                        }
                        let count = self.store(entries).await;
                        tracing::info!(%url, count, "pricing catalog refreshed");
                        return Ok(count);
                    }
                    Err(e) => last_error = Some(e),
                },
                Err(e) => last_error = Some(e),
            }
            if let Some(e) = &last_error {
                tracing::warn!(%url, error = %e, "pricing refresh failed");
            }
        }

        if let (Some(path), Some(_)) = (&self.cache_path, cache_age) {
            let entries = Self::read_cache(path).await?;
            let count = self.store(entries).await;
            tracing::info!(path = %path.display(), count, "using stale pricing cache");
            return Ok(count);
        }

        Err(last_error.unwrap_or_else(|| AgentError::Config {
            reason: "no pricing cache or remote catalog configured".into(),
        }))
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn catalog_json() -> Value {
        json!({
            "sample_spec": {
                "max_tokens": "LEGACY parameter. set to max_output_tokens if provider specifies it.",
                "max_input_tokens": "max input tokens, if the provider specifies it.",
                "input_cost_per_token": 0.0
            },
            "claude-3-5-sonnet-20241022": {
                "input_cost_per_token": 0.000003,
                "output_cost_per_token": 0.000015,
                "max_input_tokens": 200000,
                "litellm_provider": "anthropic",
                "supports_function_calling": true
            },
            "openrouter/openai/gpt-4o": {
                "input_cost_per_token": 0.0000025,
                "output_cost_per_token": 0.00001
            }
        })
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let entries = parse_catalog(catalog_json().to_string().as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries.contains_key("sample_spec"));
        assert_eq!(
            entries["claude-3-5-sonnet-20241022"].litellm_provider.as_deref(),
            Some("anthropic")
        );
    }

    #[test]
    fn cost_uses_per_token_prices() {
        let meta = ModelMetadata::priced(0.000003, 0.000015);
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 100,
            ..Usage::default()
        };
        assert!((meta.cost(&usage) - 0.0045).abs() < 1e-12);
    }

    #[tokio::test]
    async fn lookup_with_and_without_vendor_prefix() {
        let catalog = ModelCatalog::from_entries(
            parse_catalog(catalog_json().to_string().as_bytes()).unwrap(),
        );
        assert!(catalog.get("claude-3-5-sonnet-20241022").await.is_some());
        assert!(catalog.get("anthropic/claude-3-5-sonnet-20241022").await.is_some());
        assert!(catalog.get("openrouter/openai/gpt-4o").await.is_some());
        assert!(catalog.get("gpt-4o").await.is_none());

        let usage = Usage {
            input_tokens: 10,
            output_tokens: 10,
            ..Usage::default()
        };
        let priced = priced_usage(&catalog, "anthropic/claude-3-5-sonnet-20241022", &usage).await;
        assert!(priced.cost > 0.0);
        let free = priced_usage(&catalog, "unknown-model", &usage).await;
        assert_eq!(free.cost, 0.0);
    }

    #[tokio::test]
    async fn fresh_cache_is_used_without_remote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.json");
        std::fs::write(&path, catalog_json().to_string()).unwrap();

        let catalog = ModelCatalog::new().with_cache_path(&path);
        assert_eq!(catalog.load().await.unwrap(), 2);
        assert_eq!(catalog.len().await, 2);

        catalog.clear().await;
        assert!(catalog.is_empty().await);
        assert!(catalog.get("claude-3-5-sonnet-20241022").await.is_none());
    }

    #[tokio::test]
    async fn remote_fetch_writes_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prices.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(catalog_json()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested").join("prices.json");
        let catalog = ModelCatalog::new()
            .with_cache_path(&cache)
            .with_remote_url(format!("{}/prices.json", server.uri()));

        assert_eq!(catalog.load().await.unwrap(), 2);
        assert!(cache.exists());

        // The cache is now fresh; a second load must not hit the network.
        assert_eq!(catalog.load().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_cache_used_when_remote_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.json");
        std::fs::write(&path, catalog_json().to_string()).unwrap();

        let catalog = ModelCatalog::new()
            .with_cache_path(&path)
            .with_remote_url(server.uri())
            .with_refresh_interval(Duration::ZERO);
        assert_eq!(catalog.load().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn no_sources_is_an_error() {
        let catalog = ModelCatalog::new();
        assert!(catalog.load().await.unwrap_err().is_config());
    }
}
