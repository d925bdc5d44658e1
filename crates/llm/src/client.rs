use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{ByteStream, ChatBackend, ChatRequest, LlmError};

/// HTTP client for an Ollama host (Ollama Cloud by default).
#[derive(Debug, Clone)]
pub struct OllamaCloudClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OllamaCloudClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for OllamaCloudClient {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.is_some(),
            "posting chat request upstream"
        );

        let response = self
            .client
            .post(self.endpoint("/api/chat"))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), model = %request.model, "upstream rejected chat request");
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(LlmError::from))))
    }

    async fn list_models(&self) -> Result<Vec<Value>, LlmError> {
        // `/api/tags` does not require authentication.
        let response = self
            .client
            .get(self.endpoint("/api/tags"))
            .timeout(Duration::from_secs(6))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        let models = body
            .get("models")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(count = models.len(), "fetched model list");
        Ok(models)
    }
}
