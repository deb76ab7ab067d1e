//! OpenAI-compatible `/v1/chat/completions` client shared by the adapters.

use super::{GenerationOptions, Prompt, ProviderError, Response, Result, TextChunk, TextStream, Usage};
use crate::config::SecretString;
use eventsource_stream::Eventsource;
use futures::{StreamExt, future};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ChatCompletionsClient {
    base_url: String,
    api_key: Option<SecretString>,
    client: Client,
}

impl ChatCompletionsClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<SecretString>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// `GET /health` reporting `ok` or `healthy`.
    pub async fn health(&self) -> bool {
        match self.get("/health").send().await {
            Ok(response) => response
                .json::<HealthResponse>()
                .await
                .map(|health| health.status == "ok" || health.status == "healthy")
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// `GET /v1/models` answering with a success status.
    pub async fn models_reachable(&self) -> bool {
        match self.get("/v1/models").send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        response_format: Option<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let request = ChatRequest::new(prompt, options, response_format, false);

        // Dropping the in-flight future aborts the HTTP request.
        let send = async {
            let response = self.post("/v1/chat/completions").json(&request).send().await?;
            let response = check_status(response).await?;
            let body: ChatResponse = response.json().await?;
            Ok::<_, ProviderError>(body)
        };
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            body = send => body?,
        };

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices".to_string()))?;

        Ok(Response {
            text: choice.message.content.unwrap_or_default(),
            model: body.model.unwrap_or_else(|| options.model.clone()),
            finish_reason: choice.finish_reason,
            usage: body.usage.map(Usage::from),
        })
    }

    pub async fn stream(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<TextStream> {
        let request = ChatRequest::new(prompt, options, None, true);

        let send = async {
            let response = self.post("/v1/chat/completions").json(&request).send().await?;
            check_status(response).await
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = send => response?,
        };

        let stream = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(event) if event.data.trim() == "[DONE]"))
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) => parse_stream_event(&event.data).map(Ok),
                    Err(e) => Some(Err(ProviderError::Stream(e.to_string()))),
                })
            })
            // Dropping the body stream closes the connection.
            .take_until(cancel.clone().cancelled_owned());

        Ok(Box::pin(stream))
    }
}

/// Turn a non-success response into the matching error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(classify_http_error(status, body))
}

pub(crate) fn classify_http_error(status: u16, body: String) -> ProviderError {
    let lower = body.to_lowercase();
    match status {
        413 => ProviderError::ContextTooLarge(body),
        400 if lower.contains("context") && (lower.contains("length") || lower.contains("window")) => {
            ProviderError::ContextTooLarge(body)
        }
        400 | 403
            if ["content_policy", "content policy", "content_filter"]
                .iter()
                .any(|needle| lower.contains(needle)) =>
        {
            ProviderError::ContentPolicy(body)
        }
        408 | 504 => ProviderError::Timeout,
        502 | 503 => ProviderError::Unavailable(body),
        _ => ProviderError::Http { status, body },
    }
}

fn parse_stream_event(data: &str) -> Option<TextChunk> {
    let response: ChatStreamResponse = match serde_json::from_str(data) {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("skipping unparseable stream event: {e}");
            return None;
        }
    };
    let choice = response.choices.into_iter().next()?;
    let delta = choice.delta.and_then(|d| d.content).unwrap_or_default();
    if delta.is_empty() && choice.finish_reason.is_none() {
        return None;
    }
    Some(TextChunk {
        delta,
        finish_reason: choice.finish_reason,
    })
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    stream: bool,
}

impl<'a> ChatRequest<'a> {
    fn new(
        prompt: &'a Prompt,
        options: &'a GenerationOptions,
        response_format: Option<serde_json::Value>,
        stream: bool,
    ) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &prompt.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt.user,
        });

        Self {
            model: &options.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            response_format,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl From<ChatUsage> for Usage {
    fn from(usage: ChatUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
            total_tokens: usage.total_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatStreamResponse {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: Option<ChatStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}
