use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use opsdesk_core::config::LlmConfig;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Client for any endpoint that speaks the OpenAI chat-completions protocol
/// (OpenAI itself, Ollama, most local gateways).
pub struct OpenAiCompatibleClient {
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build http client for llm provider")?;

        Ok(Self {
            base_url: config.effective_base_url(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            http_client,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage { role: "user".to_string(), content: prompt.to_string() }],
            temperature: 0.0,
        };

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.context("llm request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("llm api error {status}: {body_text}"));
        }

        let parsed: ChatResponse =
            response.json().await.context("failed to parse llm response body")?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("llm response contained no choices"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 2, initial_delay_ms: 250, max_delay_ms: 4_000, backoff_multiplier: 2.0 }
    }
}

/// Retries transient upstream failures (rate limits, 5xx, timeouts) with
/// bounded exponential backoff.
pub struct RetryingLlmClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: LlmClient> RetryingLlmClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn is_retryable(error_msg: &str) -> bool {
        let lower = error_msg.to_lowercase();
        ["429", "rate limit", "500", "502", "503", "504", "timed out", "timeout", "connection"]
            .iter()
            .any(|needle| lower.contains(needle))
    }

    fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        (base as u64).min(self.config.max_delay_ms)
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for RetryingLlmClient<C> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(prompt).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    let error_msg = format!("{error:#}");
                    if attempt >= self.config.max_retries || !Self::is_retryable(&error_msg) {
                        return Err(error);
                    }

                    let delay_ms = self.compute_delay(attempt);
                    tracing::warn!(
                        event_name = "llm.request.retrying",
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms,
                        error = %error_msg,
                        "retrying llm request"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
