//! HTTP completion client speaking the OpenAI-compatible chat protocol.

use std::sync::OnceLock;
use std::time::Duration;

use relay_types::ProviderSpec;
use serde::Deserialize;

use crate::{CompletionClient, ProviderError};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// One completed response from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub tokens_used: u32,
}

/// Shared hardened HTTP client.
///
/// Built once per process; TLS-only, no redirects. Request timeouts are
/// applied per-request so one client serves every provider.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
            .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build HTTP client: {e}. Falling back to defaults.");
                reqwest::Client::new()
            })
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

/// Production client posting OpenAI-compatible chat completion requests.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCompletionClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: http_client().clone(),
            base_url: base_url.into(),
            api_key,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
    }
}

impl CompletionClient for HttpCompletionClient {
    async fn issue(
        &self,
        provider: &ProviderSpec,
        prompt: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = serde_json::json!({
            "model": provider.id.as_str(),
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut request = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                ProviderError::Transport(e)
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = Self::parse_retry_after(&response);
            tracing::warn!(provider = %provider.id, ?retry_after_secs, "rate limited");
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            tracing::warn!(provider = %provider.id, status = status.as_u16(), "request failed");
            return Err(ProviderError::Http {
                status: status.as_u16(),
            });
        }

        let payload: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                ProviderError::Parse {
                    detail: e.to_string(),
                }
            }
        })?;

        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let tokens_used = payload.usage.map_or(0, |u| u.total_tokens);
        tracing::debug!(
            provider = %provider.id,
            tokens_used,
            content_len = content.len(),
            "completion received"
        );

        Ok(CompletionResponse {
            content,
            tokens_used,
        })
    }
}
