//! Text-generation service client.
//!
//! Contract: `POST {endpoint}/api/generate { model, prompt, stream: false }`
//! returning `{ response: string }`. Non-2xx responses are surfaced as
//! `server error` provider failures, which the retry manager treats as
//! transient.

use serde::{Deserialize, Serialize};

use medlar_core::error::{MedlarError, Result};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// HTTP client for the local text-generation service.
#[derive(Clone)]
pub struct TextGenClient {
    endpoint: String,
    model: String,
    http: reqwest::Client,
}

impl TextGenClient {
    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One-shot completion. Blocks until the full response is generated.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.endpoint);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let resp = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| MedlarError::Http(format!("generate send: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MedlarError::Provider(format!(
                "server error {status}: {}",
                medlar_core::util::truncate(&body, 200)
            )));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| MedlarError::Provider(format!("generate decode: {e}")))?;
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalized() {
        let client = TextGenClient::new("http://localhost:11434/", "qwen2.5:7b");
        assert_eq!(client.endpoint, "http://localhost:11434");
        assert_eq!(client.model(), "qwen2.5:7b");
    }

    #[test]
    fn test_request_shape() {
        let request = GenerateRequest {
            model: "m",
            prompt: "p",
            stream: false,
        };
        let raw = serde_json::to_value(&request).unwrap();
        assert_eq!(raw["model"], "m");
        assert_eq!(raw["prompt"], "p");
        assert_eq!(raw["stream"], false);
    }
}
