//! Ollama LLM gateway
//!
//! HTTP client for the Ollama API with model bootstrap (pull on
//! missing), health checks, and retried generation. Failures are
//! classified so the stage can decide between redelivery and
//! acknowledgment: transient ones (timeouts, 429, 5xx, connection
//! errors) are retried with exponential backoff and jitter; permanent
//! ones (4xx, model not found) are surfaced immediately.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ResponderConfig;
use crate::{Error, Result};

/// Base delay for the first retry; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling on any single retry delay.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Progress lines logged per pull status while not verbose.
const PULL_LOG_INTERVAL: u32 = 10;

/// Generation failure, classified for retry policy.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Worth retrying: timeouts, connection failures, 429, 5xx
    #[error("transient llm failure: {0}")]
    Transient(String),
    /// Not worth retrying: client errors, missing model
    #[error("permanent llm failure: {0}")]
    Permanent(String),
}

impl LlmError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Options for a single generation call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: ModelOptions<'a>,
}

#[derive(Serialize)]
struct ModelOptions<'a> {
    temperature: f64,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: String,
}

/// Whether an HTTP status is worth retrying.
#[must_use]
pub fn is_recoverable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Exponential backoff with 0-25% jitter, capped.
#[must_use]
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY);
    let jitter = base.mul_f64(rand::rng().random_range(0.0..0.25));
    (base + jitter).min(RETRY_MAX_DELAY)
}

/// Async HTTP client for the Ollama API.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
    pull_verbose: bool,
}

impl OllamaClient {
    /// Build a client from stage configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(config: &ResponderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            pull_verbose: std::env::var("MODEL_PULL_VERBOSE")
                .is_ok_and(|v| v.eq_ignore_ascii_case("true")),
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Bootstrap at stage startup: verify the server, ensure the model
    /// exists (pulling if needed), and run a test generation.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the model is still
    /// absent after the pull attempt; this is a fatal startup failure.
    pub async fn initialize(&self) -> Result<()> {
        tracing::info!(model = %self.model, "initializing ollama client");

        if !self.health().await {
            return Err(Error::Llm("ollama server is not healthy".to_string()));
        }

        if !self.is_model_available().await? {
            tracing::info!(model = %self.model, "model not found, pulling");
            self.pull_model().await?;
            if !self.is_model_available().await? {
                return Err(Error::Llm(format!(
                    "model {} still missing after pull",
                    self.model
                )));
            }
        }

        let opts = GenerateOptions {
            temperature: 0.0,
            max_tokens: 8,
            stop: Vec::new(),
        };
        self.generate_once("Test prompt. Respond with 'Hello' only.", &opts)
            .await
            .map_err(|e| Error::Llm(format!("model test generation failed: {e}")))?;

        tracing::info!(model = %self.model, "ollama client ready");
        Ok(())
    }

    /// Whether the server answers its tags endpoint.
    pub async fn health(&self) -> bool {
        match self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "ollama health check failed");
                false
            }
        }
    }

    /// Names of the models the server has available.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the body is malformed.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?
            .error_for_status()?;

        let tags: TagsResponse = resp.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn is_model_available(&self) -> Result<bool> {
        Ok(self.list_models().await?.iter().any(|m| m == &self.model))
    }

    /// Pull the configured model, streaming progress into the log.
    ///
    /// # Errors
    ///
    /// Returns error if the pull request fails.
    pub async fn pull_model(&self) -> Result<()> {
        let mut resp = self
            .http
            .post(format!("{}/api/pull", self.base_url))
            .timeout(Duration::from_secs(600))
            .json(&serde_json::json!({ "name": self.model }))
            .send()
            .await?
            .error_for_status()?;

        let mut last_status = String::new();
        let mut progress_count: u32 = 0;
        let mut buffer = Vec::new();

        while let Some(chunk) = resp.chunk().await? {
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let Ok(progress) = serde_json::from_slice::<PullProgress>(&line) else {
                    continue;
                };

                if progress.status != last_status {
                    tracing::info!(status = %progress.status, "model pull");
                    last_status = progress.status.clone();
                } else {
                    progress_count += 1;
                    if self.pull_verbose || progress_count % PULL_LOG_INTERVAL == 0 {
                        tracing::info!(
                            status = %progress.status,
                            updates = progress_count,
                            "model pull progress"
                        );
                    }
                }

                if progress.status == "success" {
                    tracing::info!(model = %self.model, "model pulled");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// One generation attempt, classified on failure.
    async fn generate_once(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> std::result::Result<String, LlmError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: ModelOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
                stop: if options.stop.is_empty() {
                    None
                } else {
                    Some(&options.stop)
                },
            },
        };

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Transient(e.to_string())
                } else {
                    LlmError::Permanent(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = format!("status {status}: {body}");
            return if is_recoverable(status.as_u16()) {
                Err(LlmError::Transient(detail))
            } else {
                Err(LlmError::Permanent(detail))
            };
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Permanent(format!("bad generate body: {e}")))?;

        Ok(parsed.response.trim().to_string())
    }

    /// Generate a completion, retrying transient failures up to the
    /// configured budget with exponential backoff and jitter.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Transient`] when the retry budget is
    /// exhausted, [`LlmError::Permanent`] immediately on client faults.
    pub async fn generate_with_retry(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> std::result::Result<String, LlmError> {
        let mut last_transient = String::new();

        for attempt in 0..self.max_retries {
            match self.generate_once(prompt, options).await {
                Ok(text) => return Ok(text),
                Err(LlmError::Permanent(detail)) => {
                    tracing::error!(attempt, detail = %detail, "permanent generation failure");
                    return Err(LlmError::Permanent(detail));
                }
                Err(LlmError::Transient(detail)) => {
                    tracing::warn!(attempt, detail = %detail, "transient generation failure");
                    last_transient = detail;
                }
            }

            if attempt + 1 < self.max_retries {
                tokio::time::sleep(delay_for_attempt(attempt)).await;
            }
        }

        Err(LlmError::Transient(format!(
            "exhausted {} attempts: {last_transient}",
            self.max_retries
        )))
    }
}

#[async_trait::async_trait]
impl crate::api::BackendProbe for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn healthy(&self) -> bool {
        self.health().await
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "model": self.model })
    }
}

#[async_trait::async_trait]
impl super::LlmGateway for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> std::result::Result<String, LlmError> {
        self.generate_with_retry(prompt, options).await
    }

    async fn health(&self) -> bool {
        Self::health(self).await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Self::list_models(self).await
    }
}
