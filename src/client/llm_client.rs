//! Generic LLM client for OpenAI-compatible endpoints.
//!
//! Epistemic foundation:
//! - K_i: OpenAI API schema is the de facto standard
//! - K_i: Hugging Face inference, OpenRouter, vLLM and Ollama all support it
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Network availability unknowable → retry with backoff

use crate::client::{RateLimiter, TextGenerator};
use crate::models::{LlmApiError, LlmConfig, ModelSpec, PipelineError, Result, expand_headers};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f64,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// API error response.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,
    /// Model used (may differ from requested)
    pub model: String,
    /// Input tokens
    pub input_tokens: u32,
    /// Output tokens
    pub output_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
    /// Estimated cost in USD
    pub cost_usd: f64,
    /// Request duration
    pub duration: Duration,
}

/// Longest delay honored from a `retry-after` header.
const MAX_RETRY_AFTER_SECS: f64 = 60.0;

/// Read a `retry-after` header as seconds, ignoring values that are not a
/// finite, non-negative number.
fn retry_after_secs(headers: &HeaderMap) -> f64 {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map_or(1.0, |secs| secs.min(MAX_RETRY_AFTER_SECS))
}

/// LLM client for any OpenAI-compatible endpoint.
///
/// Features:
/// - Automatic rate limit handling with adaptive backoff
/// - Response header parsing for proactive throttling
/// - Cost per completion
/// - Retry with exponential backoff
/// - Custom headers for auth flexibility
pub struct LlmClient {
    client: reqwest::Client,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    /// Base URL for the API
    base_url: String,
    /// Custom headers to include in requests
    custom_headers: HashMap<String, String>,
    /// Request timeout
    timeout: Duration,
    /// Maximum attempts per request
    max_retries: u32,
    /// First retry delay, doubled on every further attempt
    retry_backoff: Duration,
    /// Rate limiter
    rate_limiter: Arc<RateLimiter>,
}

impl LlmClient {
    /// Create a new LLM client.
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        custom_headers: HashMap<String, String>,
        timeout_secs: u64,
        max_retries: u32,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PipelineError::Network)?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            custom_headers,
            timeout,
            max_retries: max_retries.max(1),
            retry_backoff: Duration::from_secs(1),
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
        })
    }

    /// Create a client from the `[llm]` config section and a resolved key.
    pub fn from_config(config: &LlmConfig, api_key: Option<String>) -> Result<Self> {
        Self::new(
            api_key,
            config.base_url.clone(),
            expand_headers(&config.headers),
            config.timeout_secs,
            config.max_retries,
            None,
        )
    }

    /// Set the delay before the first retry.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Build headers for a request.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(value) = self
            .api_key
            .as_ref()
            .and_then(|key| HeaderValue::from_str(&format!("Bearer {key}")).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in &self.custom_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        headers
    }

    /// Calculate cost for a request.
    fn calculate_cost(model_spec: &ModelSpec, input_tokens: u32, output_tokens: u32) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * model_spec.input_price_per_1m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * model_spec.output_price_per_1m;
        input_cost + output_cost
    }

    /// Delay before retrying after a failed `attempt` (zero-based).
    fn retry_delay(&self, error: &PipelineError, attempt: u32) -> Duration {
        error
            .retry_after()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_else(|| self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt)))
    }

    /// Complete a chat request.
    ///
    /// B_i(API available) → Result
    /// B_i(valid response) → Result
    /// I^B(rate limits) → adaptive backoff
    pub async fn complete(
        &self,
        model: &ModelSpec,
        messages: &[Message],
    ) -> Result<CompletionResponse> {
        let start = Instant::now();

        let request = ChatCompletionRequest {
            model: &model.id,
            messages,
            max_tokens: model.max_tokens,
            temperature: model.temperature,
        };

        let mut attempt = 0;
        loop {
            self.rate_limiter.wait_if_needed(&model.id).await;

            let error = match self.send(model, &request, start).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            // Client errors won't change on retry
            if !error.is_retryable() {
                return Err(error);
            }
            if attempt + 1 >= self.max_retries {
                return Err(PipelineError::LlmApi(LlmApiError::MaxRetriesExceeded {
                    attempts: self.max_retries,
                    last_error: error.to_string(),
                }));
            }

            let delay = self.retry_delay(&error, attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Send one chat completion request and map the response.
    async fn send(
        &self,
        model: &ModelSpec,
        request: &ChatCompletionRequest<'_>,
        start: Instant,
    ) -> Result<CompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout(self.timeout)
                } else {
                    PipelineError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        self.rate_limiter.record_request(&model.id, status, &headers);

        if status == 429 {
            return Err(PipelineError::RateLimited {
                retry_after_secs: retry_after_secs(&headers),
            });
        }

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error = match status {
                401 | 403 => LlmApiError::AuthenticationFailed,
                404 => LlmApiError::ModelNotFound(model.id.clone()),
                _ => LlmApiError::ApiError {
                    status,
                    message: serde_json::from_str::<ApiErrorResponse>(&error_body)
                        .map(|e| e.error.message)
                        .unwrap_or(error_body),
                },
            };
            return Err(PipelineError::LlmApi(error));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::ParseError(format!("Failed to parse response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| PipelineError::ParseError("No choices in response".to_string()))?;

        let usage = body.usage.unwrap_or_default();
        let cost = Self::calculate_cost(model, usage.prompt_tokens, usage.completion_tokens);

        Ok(CompletionResponse {
            content,
            model: body.model.unwrap_or_else(|| model.id.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost_usd: cost,
            duration: start.elapsed(),
        })
    }

    /// Health check: ping the /models endpoint.
    ///
    /// K_i: endpoint is reachable and responding
    /// B_i: endpoint is healthy if /models returns 200
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/models", self.base_url);

        match self
            .client
            .get(&url)
            .headers(self.headers())
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    HealthCheckResult {
                        endpoint: self.base_url.clone(),
                        status: HealthStatus::Healthy,
                        latency_ms: Some(latency_ms),
                        error: None,
                    }
                } else {
                    HealthCheckResult {
                        endpoint: self.base_url.clone(),
                        status: HealthStatus::Unhealthy,
                        latency_ms: Some(latency_ms),
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: self.base_url.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, model: &ModelSpec, messages: &[Message]) -> Result<CompletionResponse> {
        self.complete(model, messages).await
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Endpoint checked
    pub endpoint: String,
    /// Health status
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Endpoint is responding normally
    Healthy,
    /// Endpoint is responding but with errors
    Unhealthy,
    /// Endpoint is not reachable
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
