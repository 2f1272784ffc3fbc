use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use warden_core::breaker::CircuitBreaker;
use warden_core::config::{ModelConfig, ModelProvider};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Already sanitized and redacted. Raw user text never reaches this
    /// struct.
    pub prompt: String,
    pub template_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub model_id: String,
    pub model_version: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not reach the inference backend: {0}")]
    Connection(String),
    #[error("inference backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// HTTP client for the configured provider. The request timeout is set on
/// the client so a hung backend cannot stall the pipeline.
pub struct HttpModelClient {
    client: Client,
    config: ModelConfig,
}

impl HttpModelClient {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ModelError::Connection(error.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        match self.config.provider {
            ModelProvider::Ollama => format!(
                "{}/api/generate",
                self.config.base_url.as_deref().unwrap_or("http://localhost:11434")
            ),
            ModelProvider::OpenAi => self
                .config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            ModelProvider::Anthropic => self
                .config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string()),
        }
    }

    fn body(&self, request: &ModelRequest) -> serde_json::Value {
        match self.config.provider {
            ModelProvider::Ollama => json!({
                "model": self.config.model,
                "prompt": request.prompt,
                "stream": false,
            }),
            ModelProvider::OpenAi => json!({
                "model": self.config.model,
                "messages": [{"role": "user", "content": request.prompt}],
            }),
            ModelProvider::Anthropic => json!({
                "model": self.config.model,
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": request.prompt}],
            }),
        }
    }

    fn extract_text(&self, payload: &serde_json::Value) -> Option<String> {
        match self.config.provider {
            ModelProvider::Ollama => {
                payload.get("response").and_then(|value| value.as_str()).map(str::to_string)
            }
            ModelProvider::OpenAi => payload
                .pointer("/choices/0/message/content")
                .and_then(|value| value.as_str())
                .map(str::to_string),
            ModelProvider::Anthropic => payload
                .pointer("/content/0/text")
                .and_then(|value| value.as_str())
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let mut builder = self.client.post(self.endpoint()).json(&self.body(request));

        if let Some(api_key) = &self.config.api_key {
            builder = match self.config.provider {
                ModelProvider::Anthropic => {
                    builder.header("x-api-key", api_key.expose_secret())
                }
                _ => builder.bearer_auth(api_key.expose_secret()),
            };
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                ModelError::Timeout(Duration::from_secs(self.config.timeout_secs))
            } else {
                ModelError::Connection(error.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ModelError::Unavailable(format!(
                "backend returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|error| ModelError::Connection(error.to_string()))?;
        let text = self
            .extract_text(&payload)
            .ok_or_else(|| ModelError::Unavailable("no text in backend response".to_string()))?;

        Ok(ModelResponse {
            text,
            model_id: self.config.model.clone(),
            model_version: payload
                .get("model")
                .and_then(|value| value.as_str())
                .unwrap_or(&self.config.model)
                .to_string(),
        })
    }
}

/// Wraps any model client with the circuit breaker and a hard timeout. Every
/// outcome is reported back to the breaker; an open breaker fails fast
/// without touching the inner client.
pub struct GuardedModelClient {
    inner: Arc<dyn ModelClient>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl GuardedModelClient {
    pub fn new(
        inner: Arc<dyn ModelClient>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self { inner, breaker, timeout }
    }
}

#[async_trait]
impl ModelClient for GuardedModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.breaker
            .try_acquire()
            .map_err(|open| ModelError::Unavailable(open.to_string()))?;

        match tokio::time::timeout(self.timeout, self.inner.complete(request)).await {
            Ok(Ok(response)) => {
                self.breaker.record_success();
                Ok(response)
            }
            Ok(Err(error)) => {
                self.breaker.record_failure();
                Err(error)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(ModelError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use warden_core::breaker::{BreakerConfig, BreakerState, CircuitBreaker};

    use super::{GuardedModelClient, ModelClient, ModelError, ModelRequest, ModelResponse};

    struct ScriptedClient {
        fail: bool,
        hang: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            _request: &ModelRequest,
        ) -> Result<ModelResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail {
                return Err(ModelError::Connection("refused".to_string()));
            }
            Ok(ModelResponse {
                text: "{}".to_string(),
                model_id: "test-model".to_string(),
                model_version: "test-model-1".to_string(),
            })
        }
    }

    fn request() -> ModelRequest {
        ModelRequest { prompt: "classify this".to_string(), template_version: "t1".to_string() }
    }

    #[tokio::test]
    async fn success_passes_through_and_closes_breaker() {
        let inner = Arc::new(ScriptedClient {
            fail: false,
            hang: false,
            calls: AtomicUsize::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::default());
        let guarded =
            GuardedModelClient::new(inner.clone(), breaker.clone(), Duration::from_secs(5));

        let response = guarded.complete(&request()).await.unwrap();

        assert_eq!(response.model_id, "test-model");
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.metrics().success_count, 1);
    }

    #[tokio::test]
    async fn repeated_failures_open_the_breaker_and_stop_calls() {
        let inner = Arc::new(ScriptedClient {
            fail: true,
            hang: false,
            calls: AtomicUsize::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        }));
        let guarded =
            GuardedModelClient::new(inner.clone(), breaker.clone(), Duration::from_secs(5));

        assert!(guarded.complete(&request()).await.is_err());
        assert!(guarded.complete(&request()).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        // Third call fails fast without reaching the inner client.
        let error = guarded.complete(&request()).await.unwrap_err();
        assert!(matches!(error, ModelError::Unavailable(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_times_out_and_counts_as_failure() {
        let inner =
            Arc::new(ScriptedClient { fail: false, hang: true, calls: AtomicUsize::new(0) });
        let breaker = Arc::new(CircuitBreaker::default());
        let guarded =
            GuardedModelClient::new(inner, breaker.clone(), Duration::from_millis(100));

        let error = guarded.complete(&request()).await.unwrap_err();

        assert!(matches!(error, ModelError::Timeout(_)));
        assert_eq!(breaker.metrics().failure_count, 1);
    }
}
