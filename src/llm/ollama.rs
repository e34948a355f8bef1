use serde::Deserialize;
use serde_json::json;

use super::client::LlmClient;
use super::LlmError;

/// HTTP client for an Ollama-compatible local inference endpoint.
///
/// Owns two blocking clients with different timeouts:
/// - `client`: long timeout for generation (cold model loads are slow)
/// - `client_quick`: 5 s for health checks
///
/// Blocking stays blocking; the turn loop is synchronous and callers thread
/// as needed.
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    client_quick: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        let client_quick = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to create quick HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            client_quick,
        }
    }

    /// Default local instance with the per-call timeout from the engine
    /// configuration (15 s unless overridden).
    pub fn default_local(model: &str) -> Self {
        Self::new("http://localhost:11434", model, 15)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Lightweight health check: verifies the endpoint is reachable.
    pub fn health_check(&self) -> Result<(), LlmError> {
        let url = format!("{}/", self.base_url);
        let response = self.client_quick.get(&url).send().map_err(map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::Api {
                status: response.status().as_u16(),
                message: response.text().unwrap_or_default(),
            })
        }
    }

    fn post_generate(&self, body: serde_json::Value) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), message });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| LlmError::Network(format!("Failed to parse generate response: {e}")))?;
        Ok(parsed.response)
    }
}

fn map_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else if e.is_connect() {
        LlmError::NotReachable
    } else {
        LlmError::Network(e.to_string())
    }
}

impl LlmClient for OllamaClient {
    fn generate(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        self.post_generate(json!({
            "model": self.model,
            "system": system,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": 0.2 },
        }))
    }

    fn generate_multimodal(
        &self,
        system: &str,
        prompt: &str,
        image_b64: &str,
        _mime: &str,
    ) -> Result<String, LlmError> {
        self.post_generate(json!({
            "model": self.model,
            "system": system,
            "prompt": prompt,
            "images": [image_b64],
            "stream": false,
            "options": { "temperature": 0.2 },
        }))
    }
}
