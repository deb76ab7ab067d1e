//! Hosted OpenAI-compatible API

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ChatCompletionsClient, GenerationOptions, InferenceProvider, Prompt, ProviderError, Response,
    Result, TextStream,
};
use crate::config::SecretString;

pub struct RemoteApiProvider {
    client: ChatCompletionsClient,
}

impl RemoteApiProvider {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self> {
        Ok(Self {
            client: ChatCompletionsClient::new(base_url, Some(api_key))?,
        })
    }

    /// Create from `DVM_API_URL` and `DVM_API_KEY`
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("DVM_API_URL")
            .map_err(|_| ProviderError::Unavailable("DVM_API_URL not set".to_string()))?;
        let api_key = std::env::var("DVM_API_KEY")
            .map_err(|_| ProviderError::Unavailable("DVM_API_KEY not set".to_string()))?;
        Self::new(base_url, SecretString::new(api_key))
    }
}

#[async_trait]
impl InferenceProvider for RemoteApiProvider {
    fn id(&self) -> &str {
        "remote_api"
    }

    async fn is_ready(&self) -> bool {
        self.client.models_reachable().await
    }

    async fn generate_text(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.client.complete(prompt, options, None, cancel).await
    }

    async fn stream_text(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<TextStream> {
        self.client.stream(prompt, options, cancel).await
    }

    async fn generate_structured(
        &self,
        prompt: &Prompt,
        schema: &serde_json::Value,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let format = serde_json::json!({
            "type": "json_schema",
            "json_schema": { "name": "result", "schema": schema, "strict": true },
        });
        self.client.complete(prompt, options, Some(format), cancel).await
    }
}
