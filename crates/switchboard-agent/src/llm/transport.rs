//! Shared HTTP transport for every vendor.
//!
//! Adapters produce an [`HttpRequest`]; [`HttpTransport`] sends it with a
//! retry policy and a middleware chain wrapped around each attempt.  Every
//! wait observes the caller's cancellation token.
//!
//! Complete requests run under a total deadline.  Streams only have an idle
//! limit between reads, so a long generation is never cut off midway.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A fully prepared HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Vendor name for logs and error context.
    pub vendor: String,
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// A `POST` request.
    pub fn post(
        vendor: impl Into<String>,
        url: impl Into<String>,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            method: Method::POST,
            url: url.into(),
            headers,
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// When and how long to wait before retrying.
///
/// 429 and 5xx responses are retried, as are connect and timeout failures.
/// Other 4xx responses are returned immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff for a zero-based retry number, capped at
    /// `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;
        let cap = self.max_delay.as_nanos() as f64;
        Duration::from_nanos(nanos.min(cap).round() as u64)
    }

    /// Delay before retrying a response, honouring `retry-after-ms` and then
    /// `retry-after` (seconds or an HTTP date).
    pub fn delay_for(&self, headers: &HeaderMap, retry: u32) -> Duration {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let hinted = header("retry-after-ms")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_nanos((ms * 1_000_000.0).round() as u64))
            .or_else(|| header("retry-after").and_then(parse_retry_after));

        hinted
            .unwrap_or_else(|| self.backoff(retry))
            .min(self.max_delay)
    }

    /// Whether a status is worth retrying.
    pub fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0)
            .then(|| Duration::from_nanos((secs * 1_000_000_000.0).round() as u64));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// What one attempt produced.
#[derive(Debug)]
pub enum AttemptOutcome<'a> {
    Response {
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    Error(&'a reqwest::Error),
}

/// Hooks run around every attempt, in registration order.
pub trait Middleware: Send + Sync {
    fn on_request(&self, _request: &HttpRequest, _attempt: u32) {}

    fn on_response(
        &self,
        _request: &HttpRequest,
        _attempt: u32,
        _outcome: &AttemptOutcome<'_>,
        _elapsed: Duration,
    ) {
    }
}

/// Structured logging of each attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn on_request(&self, request: &HttpRequest, attempt: u32) {
        tracing::debug!(
            vendor = %request.vendor,
            url = %request.url,
            attempt,
            bytes = request.body.len(),
            "sending LLM request"
        );
    }

    fn on_response(
        &self,
        request: &HttpRequest,
        attempt: u32,
        outcome: &AttemptOutcome<'_>,
        elapsed: Duration,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            AttemptOutcome::Response { status, .. } => tracing::debug!(
                vendor = %request.vendor,
                status = status.as_u16(),
                attempt,
                elapsed_ms,
                "LLM response received"
            ),
            AttemptOutcome::Error(e) => tracing::warn!(
                vendor = %request.vendor,
                error = %e,
                attempt,
                elapsed_ms,
                "LLM request failed"
            ),
        }
    }
}

/// The most recent rate-limit headers seen from a vendor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub vendor: Option<String>,
    /// Lower-cased header name to value.
    pub headers: BTreeMap<String, String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    fn number(&self, names: &[&str]) -> Option<u64> {
        names
            .iter()
            .find_map(|name| self.headers.get(*name))
            .and_then(|v| v.trim().parse().ok())
    }

    /// Requests left in the current window.
    pub fn remaining_requests(&self) -> Option<u64> {
        self.number(&[
            "x-ratelimit-remaining-requests",
            "anthropic-ratelimit-requests-remaining",
        ])
    }

    /// Tokens left in the current window.
    pub fn remaining_tokens(&self) -> Option<u64> {
        self.number(&[
            "x-ratelimit-remaining-tokens",
            "anthropic-ratelimit-tokens-remaining",
        ])
    }
}

/// Captures `x-ratelimit-*` and `anthropic-ratelimit-*` headers.
#[derive(Debug, Clone, Default)]
pub struct RateLimitMiddleware {
    snapshot: Arc<RwLock<RateLimitSnapshot>>,
}

impl RateLimitMiddleware {
    pub fn new(snapshot: Arc<RwLock<RateLimitSnapshot>>) -> Self {
        Self { snapshot }
    }
}

impl Middleware for RateLimitMiddleware {
    fn on_response(
        &self,
        request: &HttpRequest,
        _attempt: u32,
        outcome: &AttemptOutcome<'_>,
        _elapsed: Duration,
    ) {
        let AttemptOutcome::Response { headers, .. } = outcome else {
            return;
        };
        let captured: BTreeMap<String, String> = headers
            .iter()
            .filter(|(name, _)| {
                let name = name.as_str();
                name.starts_with("x-ratelimit-") || name.starts_with("anthropic-ratelimit-")
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        if captured.is_empty() {
            return;
        }

        match self.snapshot.write() {
            Ok(mut snapshot) => {
                *snapshot = RateLimitSnapshot {
                    vendor: Some(request.vendor.clone()),
                    headers: captured,
                    captured_at: Some(Utc::now()),
                };
            }
            Err(e) => tracing::warn!(error = %e, "rate limit snapshot lock poisoned"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// HTTP client with retries and middleware.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    retry: RetryPolicy,
    /// Deadline for [`HttpTransport::execute_bytes`], body included.
    request_timeout: Option<Duration>,
    middleware: Vec<Arc<dyn Middleware>>,
    rate_limits: Arc<RwLock<RateLimitSnapshot>>,
}

impl HttpTransport {
    /// Wrap an existing client.  Tracing and rate-limit capture are
    /// installed by default.
    pub fn new(http: reqwest::Client) -> Self {
        let rate_limits = Arc::new(RwLock::new(RateLimitSnapshot::default()));
        Self {
            http,
            retry: RetryPolicy::default(),
            request_timeout: None,
            middleware: vec![
                Arc::new(TracingMiddleware),
                Arc::new(RateLimitMiddleware::new(rate_limits.clone())),
            ],
            rate_limits,
        }
    }

    /// Build a client with a connect timeout and a limit on how long any
    /// single read may stall.
    pub fn with_timeouts(connect: Duration, read_idle: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect)
            .read_timeout(read_idle)
            .build()
            .map_err(|e| AgentError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::new(http))
    }

    /// Total deadline for complete (non-streamed) requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Append a middleware to the chain.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The latest captured rate-limit headers.
    pub fn rate_limits(&self) -> RateLimitSnapshot {
        self.rate_limits
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Send `request`, retrying per policy.  Returns the first 2xx response
    /// with its body unread.  Only the idle read limit applies, so this is
    /// the entry point for streams.
    pub async fn execute(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        self.send(request, cancel, None).await
    }

    async fn send(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(request));
            }
            for m in &self.middleware {
                m.on_request(request, attempt);
            }

            let started = Instant::now();
            let mut builder = self
                .http
                .request(request.method.clone(), &request.url)
                .headers(request.headers.clone())
                .body(request.body.clone());
            if let Some(deadline) = deadline {
                builder = builder.timeout(deadline);
            }
            let send = builder.send();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(request)),
                result = send => result,
            };
            let elapsed = started.elapsed();

            let delay = match result {
                Ok(response) => {
                    let status = response.status();
                    let outcome = AttemptOutcome::Response {
                        status,
                        headers: response.headers(),
                    };
                    for m in &self.middleware {
                        m.on_response(request, attempt, &outcome, elapsed);
                    }

                    if status.is_success() {
                        return Ok(response);
                    }
                    if !RetryPolicy::is_retryable(status) || attempt >= self.retry.max_retries {
                        let body = response.text().await.unwrap_or_default();
                        return Err(AgentError::Api {
                            vendor: request.vendor.clone(),
                            status: status.as_u16(),
                            body,
                        });
                    }
                    self.retry.delay_for(response.headers(), attempt)
                }
                Err(e) => {
                    let outcome = AttemptOutcome::Error(&e);
                    for m in &self.middleware {
                        m.on_response(request, attempt, &outcome, elapsed);
                    }

                    let transient = e.is_connect() || e.is_timeout();
                    if !transient || attempt >= self.retry.max_retries {
                        return Err(AgentError::Transport {
                            vendor: request.vendor.clone(),
                            reason: e.to_string(),
                        });
                    }
                    self.retry.backoff(attempt)
                }
            };

            attempt += 1;
            tracing::warn!(
                vendor = %request.vendor,
                attempt,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying LLM request"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(request)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Send `request` and read the full body within the request deadline.
    pub async fn execute_bytes(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self.send(request, cancel, self.request_timeout).await?;
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(request)),
            bytes = response.bytes() => bytes,
        };
        bytes.map(|b| b.to_vec()).map_err(|e| AgentError::Transport {
            vendor: request.vendor.clone(),
            reason: format!("failed to read response body: {e}"),
        })
    }
}

fn cancelled(request: &HttpRequest) -> AgentError {
    AgentError::Cancelled {
        operation: format!("{} request", request.vendor),
        partial: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
