//! Client for OpenAI-compatible chat-completions endpoints.
//!
//! - Works against hosted APIs and local servers (vLLM, Ollama, llama.cpp)
//! - Transport failures, 429 and 5xx are retried with exponential backoff
//! - 401 and 404 fail immediately
//! - Token usage is accumulated for the run summary

use crate::models::{ApiConfig, ApiError, ModelSpec, PeruseError, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
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
    messages: Vec<Message>,
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
}

/// API error response (OpenAI-compatible).
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
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Request duration, retries included
    pub duration: Duration,
}

/// Chat-completions client bound to one endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
}

impl LlmClient {
    /// Create a client for the configured endpoint.
    ///
    /// `api_key` may be `None` for local endpoints without auth.
    pub fn new(api: &ApiConfig, api_key: Option<String>) -> Result<Self> {
        let timeout = Duration::from_secs(api.timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PeruseError::Network)?;

        Ok(Self {
            client,
            api_key,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            timeout,
            max_retries: api.max_retries.max(1),
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// Complete a chat request with the model's sampling settings.
    pub async fn complete(&self, model: &ModelSpec, messages: Vec<Message>) -> Result<CompletionResponse> {
        let start = Instant::now();
        let request = ChatCompletionRequest {
            model: &model.id,
            messages,
            max_tokens: model.max_tokens,
            temperature: model.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error: Option<PeruseError> = None;

        for attempt in 0..self.max_retries {
            let is_last = attempt + 1 == self.max_retries;

            let response = match self
                .client
                .post(&url)
                .headers(self.headers())
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        PeruseError::Timeout(self.timeout)
                    } else {
                        PeruseError::Network(e)
                    });
                    if !is_last {
                        let backoff = backoff(attempt);
                        debug!(
                            model = %model.id,
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .unwrap_or(1.0);

                last_error = Some(PeruseError::RateLimited {
                    retry_after_secs: retry_after,
                });
                if !is_last {
                    debug!(
                        model = %model.id,
                        attempt = attempt,
                        retry_after_secs = retry_after,
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                }
                continue;
            }

            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                let error = PeruseError::Api(classify_error(status, &body, &model.id));
                let retryable = error.is_retryable();
                last_error = Some(error);

                if !retryable {
                    break;
                }
                if !is_last {
                    tokio::time::sleep(backoff(attempt)).await;
                }
                continue;
            }

            let body: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| PeruseError::ParseError(format!("Failed to parse response: {e}")))?;

            let content = body
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| PeruseError::ParseError("No content in response".to_string()))?;

            let usage = body.usage.unwrap_or_default();
            self.total_input_tokens
                .fetch_add(u64::from(usage.prompt_tokens), Ordering::Relaxed);
            self.total_output_tokens
                .fetch_add(u64::from(usage.completion_tokens), Ordering::Relaxed);

            return Ok(CompletionResponse {
                content,
                model: body.model.unwrap_or_else(|| model.id.clone()),
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                duration: start.elapsed(),
            });
        }

        Err(match last_error {
            Some(e) if !e.is_retryable() => e,
            Some(e) => PeruseError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: e.to_string(),
            }),
            None => PeruseError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            }),
        })
    }

    /// Complete with system and user prompts.
    pub async fn complete_with_system(
        &self,
        model: &ModelSpec,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<CompletionResponse> {
        let messages = vec![Message::system(system_prompt), Message::user(user_prompt)];
        self.complete(model, messages).await
    }

    /// Total (input, output) tokens used by this client.
    pub fn total_tokens(&self) -> (u64, u64) {
        (
            self.total_input_tokens.load(Ordering::Relaxed),
            self.total_output_tokens.load(Ordering::Relaxed),
        )
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt.min(6)))
}

/// Map a non-success response to an [`ApiError`].
fn classify_error(status: u16, body: &str, model_id: &str) -> ApiError {
    match status {
        401 => ApiError::AuthenticationFailed,
        404 => ApiError::ModelNotFound(model_id.to_string()),
        _ => {
            let message = serde_json::from_str::<ApiErrorResponse>(body)
                .map(|r| r.error.message)
                .unwrap_or_else(|_| body.to_string());
            ApiError::Status { status, message }
        }
    }
}
