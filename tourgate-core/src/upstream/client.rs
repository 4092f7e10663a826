//! HTTP client for OpenAI-compatible chat completion APIs.
//!
//! One [`CompletionService::complete`] call is one HTTP request; retries live
//! in [`UpstreamAdapter`](super::UpstreamAdapter). The reqwest client keeps a
//! connection pool to the upstream host and enforces the per-request timeout,
//! which acts as the transport backstop under the adapter's total budget.
//!
//! # Error Classification
//!
//! - reqwest timeout → [`CompletionError::Timeout`]
//! - connect/other transport failure → [`CompletionError::Transport`]
//! - non-2xx status → see `classify_http_status`
//! - 2xx with an unusable body → [`CompletionError::InvalidResponse`]

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::classify_http_status;
use super::{CompletionError, CompletionRequest, CompletionService};
use crate::config::ConfigError;

/// Configuration for the upstream completion client.
#[derive(Clone)]
pub struct UpstreamConfig {
    /// Base URL of the completion API, without the `/v1/...` path.
    pub base_url: String,
    /// Bearer token. `None` puts the gateway in offline mode.
    pub api_key: Option<String>,
    /// Model name sent with every request.
    pub model: String,
    /// Upper bound on generated tokens per reply.
    pub max_tokens: u32,
    /// Request timeout (includes connection + response)
    pub timeout: Duration,
    /// Connection timeout (TCP + TLS handshake)
    pub connect_timeout: Duration,
    /// Maximum idle connections per host
    pub pool_max_idle_per_host: usize,
    /// Maximum response body size in bytes.
    pub max_response_size: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 16,
            max_response_size: 1024 * 1024, // 1 MB
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl UpstreamConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TOURGATE_UPSTREAM_URL` (default: `https://api.openai.com`)
    /// - `TOURGATE_UPSTREAM_API_KEY` (unset or empty: offline mode)
    /// - `TOURGATE_UPSTREAM_MODEL` (default: `gpt-4o-mini`)
    /// - `TOURGATE_REQUEST_TIMEOUT_SECS` (default: 30)
    /// - `TOURGATE_UPSTREAM_CONNECT_TIMEOUT_SECS` (default: 5)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] if a timeout is set but is not a
    /// valid integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        let base_url = std::env::var("TOURGATE_UPSTREAM_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(default.base_url);

        let api_key = std::env::var("TOURGATE_UPSTREAM_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let model = std::env::var("TOURGATE_UPSTREAM_MODEL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(default.model);

        let timeout = env_secs("TOURGATE_REQUEST_TIMEOUT_SECS", default.timeout)?;
        let connect_timeout =
            env_secs("TOURGATE_UPSTREAM_CONNECT_TIMEOUT_SECS", default.connect_timeout)?;

        Ok(Self {
            base_url,
            api_key,
            model,
            timeout,
            connect_timeout,
            ..Self::default()
        })
    }

    /// Create a config pointing at `base_url` with the given key.
    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    /// True when no credentials are configured.
    pub fn is_offline(&self) -> bool {
        self.api_key.is_none()
    }
}

fn env_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidEnvVar {
                var,
                expected: "a valid integer",
                value: val,
            }),
        Err(_) => Ok(default),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// reqwest-backed [`CompletionService`].
///
/// `Clone` is cheap; the underlying reqwest client shares its pool.
#[derive(Clone)]
pub struct HttpCompletionClient {
    client: Client,
    config: UpstreamConfig,
    /// Pre-computed endpoint URL.
    completions_url: String,
}

impl HttpCompletionClient {
    /// Create a new completion client.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidUrl`] if `base_url` is not an absolute URL
    /// - [`ConfigError::HttpClient`] if the HTTP client cannot be built
    pub fn new(config: UpstreamConfig) -> Result<Self, ConfigError> {
        if let Err(e) = reqwest::Url::parse(&config.base_url) {
            return Err(ConfigError::InvalidUrl {
                url: config.base_url.clone(),
                message: e.to_string(),
            });
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let completions_url = format!(
            "{}/v1/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        Ok(Self {
            client,
            config,
            completions_url,
        })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn classify_error(&self, error: reqwest::Error) -> CompletionError {
        if error.is_timeout() {
            warn!(
                timeout_secs = self.config.timeout.as_secs(),
                "Upstream completion request timed out"
            );
            CompletionError::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            }
        } else if error.is_connect() {
            warn!(url = %self.config.base_url, "Failed to connect to upstream");
            CompletionError::Transport {
                reason: format!("connect: {error}"),
            }
        } else {
            warn!(error = %error, "Upstream completion request failed");
            CompletionError::Transport {
                reason: error.to_string(),
            }
        }
    }

    /// Read the response body, rejecting anything over `max_response_size`.
    async fn read_body_limited(
        &self,
        mut response: reqwest::Response,
    ) -> Result<Vec<u8>, CompletionError> {
        let max_size = self.config.max_response_size;

        if let Some(content_length) = response.content_length()
            && content_length as usize > max_size
        {
            return Err(CompletionError::InvalidResponse {
                reason: format!(
                    "response too large: {content_length} bytes exceeds {max_size} byte limit"
                ),
            });
        }

        let mut buf = Vec::with_capacity(
            response
                .content_length()
                .map(|cl| cl as usize)
                .unwrap_or(8192)
                .min(max_size),
        );
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.classify_error(e))?
        {
            if buf.len() + chunk.len() > max_size {
                return Err(CompletionError::InvalidResponse {
                    reason: format!(
                        "response too large: >={} bytes exceeds {max_size} byte limit",
                        buf.len() + chunk.len()
                    ),
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl CompletionService for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        messages.push(WireMessage {
            role: "system",
            content: &request.system_preamble,
        });
        messages.extend(request.turns.iter().map(|turn| WireMessage {
            role: turn.role.as_str(),
            content: &turn.content,
        }));
        let body = ChatCompletionBody {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
        };

        debug!(
            url = %self.completions_url,
            turns = request.turns.len(),
            "Sending completion request"
        );

        let mut builder = self.client.post(&self.completions_url).json(&body);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| self.classify_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = self
                .read_body_limited(response)
                .await
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            warn!(status = %status, "Upstream returned error status");
            return Err(classify_http_status(status, retry_after, &body));
        }

        let bytes = self.read_body_limited(response).await?;
        let parsed: ChatCompletionResponse =
            serde_json::from_slice(&bytes).map_err(|e| CompletionError::InvalidResponse {
                reason: format!("failed to parse completion response: {e}"),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| CompletionError::InvalidResponse {
                reason: "completion response has no content".to_string(),
            })
    }
}
