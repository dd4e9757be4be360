//! Translation-client port and the streaming HTTP provider implementation

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::chunker::approx_tokens;
use crate::core::config::ProviderConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{ProbeKind, TranslateOutcome, TranslateRequest};

/// Port for the single-request translation call.
///
/// Streaming delivers partial text through `chunks`; the cancellation token
/// aborts the call mid-stream. Implementations must map provider failures
/// into `TranslationError` rather than panicking.
#[async_trait]
pub trait TranslationClient: Send + Sync {
    /// Non-streaming call, returns only the final outcome
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateOutcome>;

    /// Streaming call forwarding each partial chunk as it arrives
    async fn translate_stream(
        &self,
        request: &TranslateRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TranslateOutcome>;
}

/// Port for throttle-recovery probing
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    /// One independently fallible probe attempt
    async fn probe(&self, kind: ProbeKind, model_id: &str) -> Result<()>;
}

/// HTTP client speaking the chat-completions shape
#[derive(Debug, Clone)]
pub struct HttpTranslationClient {
    client: reqwest::Client,
    config: Arc<ProviderConfig>,
}

impl HttpTranslationClient {
    /// Create a new client with pooled connections
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Create from environment
    pub fn from_env() -> Result<Self> {
        let config = ProviderConfig::from_env()
            .map_err(|e| TranslationError::ConfigError { message: e.to_string() })?;
        Self::new(config)
    }

    fn build_body(&self, request: &TranslateRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": request.model_id,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.content }
            ],
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.config.api_endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslationError::TimeoutError
                } else {
                    TranslationError::NetworkError { message: e.to_string() }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let status_code = status.as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let error_text = response.text().await.unwrap_or_default();

        if status_code == 429 {
            return Err(TranslationError::RateLimitError { retry_after });
        }

        Err(TranslationError::ApiError {
            status: status_code,
            message: error_text,
        })
    }

    fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens + output_tokens) as f64 / 1000.0 * self.config.price_per_1k_tokens
    }
}

#[async_trait]
impl TranslationClient for HttpTranslationClient {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateOutcome> {
        let started = Instant::now();
        let body = self.build_body(request, false);
        let response = self.send(&body).await?;

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| TranslationError::InvalidResponseError { message: e.to_string() })?;

        let translation = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| TranslationError::InvalidResponseError {
                message: "No translation in response".to_string(),
            })?
            .to_string();

        let input_tokens = json["usage"]["prompt_tokens"]
            .as_u64()
            .unwrap_or_else(|| approx_tokens(&request.content));
        let output_tokens = json["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or_else(|| approx_tokens(&translation));

        Ok(TranslateOutcome {
            cost: self.cost_of(input_tokens, output_tokens),
            translation,
            input_tokens,
            output_tokens,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn translate_stream(
        &self,
        request: &TranslateRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TranslateOutcome> {
        let started = Instant::now();
        let body = self.build_body(request, true);
        let response = self.send(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut translation = String::new();
        let mut usage: Option<(u64, u64)> = None;

        'outer: while let Some(piece) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }

            let piece = piece.map_err(|e| TranslationError::NetworkError {
                message: e.to_string(),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&piece));

            // Process complete SSE lines, keep the partial tail in the buffer
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'outer;
                }

                let event: serde_json::Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("Skipping malformed stream event: {}", e);
                        continue;
                    }
                };

                if let Some(delta) = event["choices"]
                    .get(0)
                    .and_then(|c| c["delta"]["content"].as_str())
                {
                    if cancel.is_cancelled() {
                        return Err(TranslationError::Cancelled);
                    }
                    translation.push_str(delta);
                    if chunks.send(delta.to_string()).await.is_err() {
                        debug!("Chunk receiver dropped for task {}", request.task_id);
                    }
                }

                if let (Some(p), Some(c)) = (
                    event["usage"]["prompt_tokens"].as_u64(),
                    event["usage"]["completion_tokens"].as_u64(),
                ) {
                    usage = Some((p, c));
                }
            }
        }

        if translation.is_empty() {
            return Err(TranslationError::InvalidResponseError {
                message: "Stream ended without any content".to_string(),
            });
        }

        let (input_tokens, output_tokens) = usage.unwrap_or_else(|| {
            (approx_tokens(&request.content), approx_tokens(&translation))
        });

        Ok(TranslateOutcome {
            cost: self.cost_of(input_tokens, output_tokens),
            translation,
            input_tokens,
            output_tokens,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl ProbeTarget for HttpTranslationClient {
    async fn probe(&self, kind: ProbeKind, model_id: &str) -> Result<()> {
        match kind {
            ProbeKind::Quick => {
                // Any HTTP response means the provider is reachable
                self.client
                    .get(&self.config.api_endpoint)
                    .send()
                    .await
                    .map_err(|e| TranslationError::NetworkError { message: e.to_string() })?;
                Ok(())
            }
            ProbeKind::Api => {
                let request = TranslateRequest {
                    task_id: "probe".to_string(),
                    model_id: model_id.to_string(),
                    system_prompt: "Reply with the single word: ok".to_string(),
                    content: "ping".to_string(),
                    estimated_tokens: 1,
                };
                let body = self.build_body(&request, false);
                match self.send(&body).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("API probe failed: {}", e);
                        Err(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = ProviderConfig {
            api_key: "test_key".to_string(),
            ..Default::default()
        };
        assert!(HttpTranslationClient::new(config).is_ok());
    }

    #[test]
    fn test_request_body_shape() {
        let config = ProviderConfig {
            api_key: "test_key".to_string(),
            ..Default::default()
        };
        let client = HttpTranslationClient::new(config).unwrap();
        let request = TranslateRequest {
            task_id: "t1".to_string(),
            model_id: "test-model".to_string(),
            system_prompt: "sys".to_string(),
            content: "hello".to_string(),
            estimated_tokens: 10,
        };

        let body = client.build_body(&request, true);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
    }

    #[test]
    fn test_cost_pricing() {
        let config = ProviderConfig {
            api_key: "k".to_string(),
            price_per_1k_tokens: 1.0,
            ..Default::default()
        };
        let client = HttpTranslationClient::new(config).unwrap();
        assert!((client.cost_of(500, 500) - 1.0).abs() < f64::EPSILON);
    }
}
