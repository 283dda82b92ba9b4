//! Narrow "generate text from a prompt" gateway.
//!
//! Callers in the rule subsystem only need `generate(prompt, model) -> text`
//! and must keep working when the service is down. [`LlmTextGenerator`]
//! wraps an [`LlmProvider`] with a per-call timeout and a small retry budget
//! and collapses every failure into `None`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::litellm::{GenerationRequest, LlmProvider, Message};
use crate::error::LlmError;
use crate::metrics;

/// Text generation as consumed by rule generation and repair.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Returns generated text, or `None` when the service is unavailable.
    async fn generate(&self, prompt: &str, model: Option<&str>) -> Option<String>;
}

/// Exponential backoff settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0-based), doubling up to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs an LLM operation, retrying only errors that are worth retrying.
pub async fn retry_llm<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "LLM call failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`TextGenerator`] backed by an [`LlmProvider`].
pub struct LlmTextGenerator {
    provider: Arc<dyn LlmProvider>,
    default_model: String,
    call_timeout: Duration,
    retry: RetryConfig,
    temperature: f64,
    max_tokens: u32,
    system_prompt: Option<String>,
}

impl LlmTextGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, default_model: impl Into<String>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            temperature: 0.2,
            max_tokens: 2048,
            system_prompt: None,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    async fn call_once(&self, prompt: &str, model: &str) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));
        let request = GenerationRequest::new(model, messages)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let response = timeout(self.call_timeout, self.provider.generate(request))
            .await
            .map_err(|_| LlmError::Timeout(self.call_timeout))??;

        response
            .first_content()
            .map(str::to_string)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::ParseError("empty completion".to_string()))
    }
}

#[async_trait]
impl TextGenerator for LlmTextGenerator {
    async fn generate(&self, prompt: &str, model: Option<&str>) -> Option<String> {
        let model = model.unwrap_or(&self.default_model);
        let started = Instant::now();
        let outcome = retry_llm(&self.retry, "generate", || self.call_once(prompt, model)).await;
        metrics::record_llm_request(model, outcome.is_ok(), started.elapsed().as_secs_f64());
        match outcome {
            Ok(text) => {
                debug!(model, chars = text.len(), "Text generated");
                Some(text)
            }
            Err(e) => {
                warn!(model, error = %e, "Text generation unavailable");
                None
            }
        }
    }
}
