//! Local OpenAI-compatible bridge (localhost:11435)

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ChatCompletionsClient, GenerationOptions, InferenceProvider, Prompt, Response, Result,
    TextStream,
};

pub const DEFAULT_BRIDGE_URL: &str = "http://localhost:11435";

/// Inference through a bridge process on this machine
pub struct LocalBridgeProvider {
    client: ChatCompletionsClient,
}

impl LocalBridgeProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: ChatCompletionsClient::new(base_url, None)?,
        })
    }

    /// Create from `FM_BRIDGE_URL` or the default port
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("FM_BRIDGE_URL").unwrap_or_else(|_| DEFAULT_BRIDGE_URL.to_string());
        Self::new(base_url)
    }
}

#[async_trait]
impl InferenceProvider for LocalBridgeProvider {
    fn id(&self) -> &str {
        "local_bridge"
    }

    async fn is_ready(&self) -> bool {
        self.client.health().await
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
            "json_schema": { "name": "result", "schema": schema },
        });
        self.client.complete(prompt, options, Some(format), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use futures::StreamExt;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "apple-fm".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_is_ready_reads_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(&server)
            .await;

        let provider = LocalBridgeProvider::new(server.uri()).unwrap();
        assert!(provider.is_ready().await);

        let offline = LocalBridgeProvider::new("http://127.0.0.1:9").unwrap();
        assert!(!offline.is_ready().await);
    }

    #[tokio::test]
    async fn test_generate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "apple-fm", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "model": "apple-fm",
                "choices": [{"message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = LocalBridgeProvider::new(server.uri()).unwrap();
        let response = provider
            .generate_text(&Prompt::new("Hi"), &options(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.text, "Hello!");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[tokio::test]
    async fn test_error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let provider = LocalBridgeProvider::new(server.uri()).unwrap();
        let err = provider
            .generate_text(&Prompt::new("Hi"), &options(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Unavailable("model loading".into()));
    }

    #[tokio::test]
    async fn test_stream_text() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let provider = LocalBridgeProvider::new(server.uri()).unwrap();
        let stream = provider
            .stream_text(&Prompt::new("Hi"), &options(), &CancellationToken::new())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;

        let text: String = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().delta.as_str())
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_aborts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let provider = LocalBridgeProvider::new(server.uri()).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = provider
            .generate_text(&Prompt::new("Hi"), &options(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
