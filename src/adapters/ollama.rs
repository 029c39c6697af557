//! Local inference through an Ollama server (`POST /api/generate`).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{classify_http_error, classify_status, BackendError, TextBackend};

pub struct OllamaBackend {
    base_url: String,
    model: String,
    temperature: f32,
    top_p: f32,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaBackend {
    pub fn new(
        base_url: String,
        model: String,
        temperature: f32,
        top_p: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            top_p,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl TextBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, BackendError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                top_p: self.top_p,
                num_predict: max_tokens,
            },
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling Ollama");

        let response = self
            .client
            .post(self.api_url())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_http_error(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Response(format!("invalid Ollama response: {}", e)))?;

        Ok(parsed.response)
    }
}
