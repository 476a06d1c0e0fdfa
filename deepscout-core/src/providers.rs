//! LLM provider implementations.
//!
//! Provides a concrete [`LanguageModel`] backed by any endpoint that follows
//! the OpenAI chat completions API format (OpenAI, DeepSeek, Ollama, vLLM,
//! LM Studio), plus retry with exponential backoff on transient errors.
//!
//! Use [`create_provider`] to instantiate the provider named in config.

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::LanguageModel;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff delays are capped here regardless of attempt count.
const MAX_BACKOFF_SECS: u64 = 32;

/// Retry policy for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_secs: u64,
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_secs: config.retry_initial_delay_secs,
        }
    }
}

/// Execute an async operation with jittered exponential backoff retry on
/// transient errors.
///
/// Retries on `LlmError::RateLimited` (respects `retry_after_secs`),
/// `LlmError::Connection`, and `LlmError::Timeout`. Permanent errors (auth,
/// parse, unsupported model) return immediately.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt == policy.max_retries {
                    return Err(e);
                }
                let backoff_ms = compute_backoff(policy, attempt, &e);
                let delay_ms = backoff_ms + rand::thread_rng().gen_range(0..=backoff_ms / 4);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms,
                    error = %e,
                    "Retrying after transient LLM error"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(LlmError::Connection {
        message: "All retry attempts exhausted".to_string(),
    }))
}

/// Check if an error is transient.
fn is_retryable(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::RateLimited { .. } | LlmError::Connection { .. } | LlmError::Timeout { .. }
    )
}

/// Compute backoff delay in milliseconds, respecting rate-limit retry-after.
fn compute_backoff(policy: RetryPolicy, attempt: u32, err: &LlmError) -> u64 {
    let computed = (policy.initial_delay_secs.saturating_mul(2u64.pow(attempt)))
        .min(MAX_BACKOFF_SECS)
        .saturating_mul(1000);
    if let LlmError::RateLimited { retry_after_secs } = err {
        return computed.max(retry_after_secs * 1000);
    }
    computed
}

/// Look up the context window for a known model. Returns None for unknown
/// models.
fn known_context_window(model: &str) -> Option<usize> {
    match model {
        "gpt-4o" | "gpt-4o-2024-11-20" | "gpt-4o-2024-08-06" => Some(128_000),
        "gpt-4o-mini" | "gpt-4o-mini-2024-07-18" => Some(128_000),
        "gpt-4-turbo" | "gpt-4-turbo-2024-04-09" => Some(128_000),
        "gpt-3.5-turbo" | "gpt-3.5-turbo-0125" => Some(16_385),
        "deepseek-chat" | "deepseek-reasoner" => Some(64_000),
        "qwen2.5:7b" | "qwen2.5:14b" | "qwen2.5:32b" | "qwen2.5:72b" => Some(32_768),
        "llama3.1:8b" | "llama3.1:70b" | "llama3.2:3b" | "llama3.2:1b" => Some(128_000),
        _ => None,
    }
}

/// Default base URL for a named provider. Returns None when the provider
/// needs an explicit `base_url` in config.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

/// When no context window is known from model metadata or config.
const FALLBACK_CONTEXT_WINDOW: usize = 128_000;

/// OpenAI-compatible LLM provider.
#[derive(Debug)]
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    context_window: usize,
    retry: RetryPolicy,
}

impl OpenAiCompatProvider {
    /// Create a new provider from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`. Local endpoints (localhost) get a dummy bearer
    /// token when no key is set.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .or_else(|| default_base_url(&config.provider).map(String::from))
            .ok_or_else(|| LlmError::ApiRequest {
                message: format!(
                    "provider '{}' requires an explicit base_url in [llm] config",
                    config.provider
                ),
            })?;

        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .or_else(|| {
                if is_local {
                    // Ollama, vLLM, LM Studio don't check the bearer token
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("local".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!("{}: env var '{}' not set", config.provider, config.api_key_env),
            })?;

        let context_window = config
            .context_window
            .or_else(|| known_context_window(&config.model))
            .unwrap_or(FALLBACK_CONTEXT_WINDOW);

        Ok(Self {
            client: Client::new(),
            base_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            context_window,
            retry: RetryPolicy::from(config),
        })
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 => {
                debug!(body = %body, "Authentication failed (401)");
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                // Try to parse "try again in Xs" out of the error message
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        msg.split("in ")
                            .last()
                            .and_then(|s| s.trim_end_matches('s').parse::<u64>().ok())
                    })
                    .unwrap_or(5);
                LlmError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => LlmError::Connection {
                message: format!("Server error ({status}): {body}"),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    /// Send a single (un-retried) completion request.
    async fn request_once(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "stream": false,
        });

        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Connection {
                message: format!("Request failed: {e}"),
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| LlmError::Connection {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        let parsed: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {e}"),
            })?;

        parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message content in response".to_string(),
            })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatProvider {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        with_retry(self.retry, || self.request_once(prompt)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }
}

/// Create a language model from configuration.
///
/// All supported providers speak the OpenAI chat completions format; the
/// provider name selects the default base URL.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>, LlmError> {
    match config.provider.as_str() {
        "openai" | "deepseek" | "ollama" | "openai-compatible" => {
            Ok(Arc::new(OpenAiCompatProvider::new(config)?))
        }
        other => Err(LlmError::ApiRequest {
            message: format!(
                "Unknown provider '{other}' (expected openai, deepseek, ollama, or openai-compatible)"
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_delay_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_secs: 0,
        }
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_secs: 2,
        };
        let err = LlmError::Connection {
            message: "x".into(),
        };
        assert_eq!(compute_backoff(policy, 0, &err), 2_000);
        assert_eq!(compute_backoff(policy, 1, &err), 4_000);
        assert_eq!(compute_backoff(policy, 2, &err), 8_000);
    }

    #[test]
    fn test_compute_backoff_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_secs: 2,
        };
        let err = LlmError::Timeout { timeout_secs: 1 };
        assert_eq!(compute_backoff(policy, 9, &err), MAX_BACKOFF_SECS * 1000);
    }

    #[test]
    fn test_compute_backoff_rate_limit_uses_server_value() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_secs: 2,
        };
        let err = LlmError::RateLimited {
            retry_after_secs: 30,
        };
        // server says 30s, computed is 2s, use max
        assert_eq!(compute_backoff(policy, 0, &err), 30_000);
    }

    #[test]
    fn test_is_retryable_classification() {
        assert!(is_retryable(&LlmError::RateLimited {
            retry_after_secs: 1
        }));
        assert!(is_retryable(&LlmError::Timeout { timeout_secs: 1 }));
        assert!(is_retryable(&LlmError::Connection {
            message: "x".into()
        }));
        assert!(!is_retryable(&LlmError::AuthFailed {
            provider: "x".into()
        }));
        assert!(!is_retryable(&LlmError::ResponseParse {
            message: "x".into()
        }));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_try() {
        let result = with_retry(no_delay_policy(2), || async { Ok::<_, LlmError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_retry_transient_then_success() {
        let calls = StdArc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = with_retry(no_delay_policy(2), move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LlmError::Connection {
                        message: "flaky".into(),
                    })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_permanent_error_no_retry() {
        let calls = StdArc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = with_retry(no_delay_policy(3), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::AuthFailed {
                    provider: "test".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_attempts() {
        let calls = StdArc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = with_retry(no_delay_policy(2), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Timeout { timeout_secs: 1 })
            }
        })
        .await;
        assert!(matches!(result.unwrap_err(), LlmError::Timeout { .. }));
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_known_context_windows() {
        assert_eq!(known_context_window("gpt-4o-mini"), Some(128_000));
        assert_eq!(known_context_window("gpt-3.5-turbo"), Some(16_385));
        assert_eq!(known_context_window("made-up-model"), None);
    }

    #[test]
    fn test_missing_api_key_fails() {
        let config = LlmConfig {
            api_key_env: "DEEPSCOUT_TEST_NO_SUCH_KEY".to_string(),
            ..Default::default()
        };
        let err = OpenAiCompatProvider::new(&config).unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let config = LlmConfig {
            provider: "ollama".to_string(),
            model: "qwen2.5:7b".to_string(),
            api_key_env: "DEEPSCOUT_TEST_NO_SUCH_KEY".to_string(),
            ..Default::default()
        };
        let provider = OpenAiCompatProvider::new(&config).unwrap();
        assert_eq!(provider.context_window(), 32_768);
        assert_eq!(provider.model_name(), "qwen2.5:7b");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = LlmConfig {
            provider: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn test_custom_base_url_required_for_compat() {
        let config = LlmConfig {
            provider: "openai-compatible".to_string(),
            ..Default::default()
        };
        let err = OpenAiCompatProvider::new(&config).unwrap_err();
        assert!(matches!(err, LlmError::ApiRequest { .. }));
    }
}
