//! Ollama inference engine implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{InferenceEngine, InferenceError};

/// Ollama inference engine.
///
/// Sends each payload as a non-streaming `/api/generate` call.
pub struct OllamaEngine {
    http_client: Client,
    base_url: String,
    model: String,
}

impl OllamaEngine {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

fn map_reqwest_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Failed(e.to_string())
    }
}

#[async_trait]
impl InferenceEngine for OllamaEngine {
    fn engine_type(&self) -> &'static str {
        "ollama"
    }

    // Dropping the request future closes the connection.
    fn supports_interrupt(&self) -> bool {
        true
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::Failed(format!(
                "Ollama returned {}",
                response.status()
            )))
        }
    }

    async fn infer(&self, payload: &str, deadline: Option<Instant>) -> Result<String, InferenceError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: payload,
            stream: false,
        };

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(InferenceError::Timeout);
            }
            request = request.timeout(remaining);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Failed(format!("HTTP {}: {}", status, body)));
        }

        let generated: OllamaGenerateResponse =
            response.json().await.map_err(map_reqwest_error)?;

        tracing::debug!(model = %self.model, chars = generated.response.len(), "Ollama generation finished");

        Ok(generated.response)
    }
}
