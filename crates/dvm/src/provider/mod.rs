//! Inference providers
//!
//! A provider is anything that can turn a prompt into text. The engine only
//! sees the [`InferenceProvider`] capability; which backend sits behind it is
//! decided when the engine is assembled:
//!
//! - [`LocalBridgeProvider`] - an OpenAI-compatible bridge on localhost
//!   (e.g. the Apple Foundation Models bridge on :11435)
//! - [`RemoteApiProvider`] - a hosted OpenAI-compatible API with a bearer key
//!
//! Every call takes a [`CancellationToken`]. Adapters abort the underlying
//! HTTP request when it fires rather than just dropping the result.

mod chat;
mod local_bridge;
mod remote;

pub use chat::ChatCompletionsClient;
pub use local_bridge::LocalBridgeProvider;
pub use remote::RemoteApiProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected by content policy: {0}")]
    ContentPolicy(String),

    #[error("Context too large: {0}")]
    ContextTooLarge(String),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_connect() {
            ProviderError::Unavailable(err.to_string())
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Stream(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// A fully assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
}

/// Finite, cancellable, single-use sequence of chunks.
pub type TextStream = BoxStream<'static, Result<TextChunk>>;

/// Core capability every inference backend provides.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Backend identifier (e.g. "local_bridge", "remote_api")
    fn id(&self) -> &str;

    /// Check if the backend is ready to serve requests
    async fn is_ready(&self) -> bool;

    async fn generate_text(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Response>;

    async fn stream_text(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<TextStream>;

    /// Generate JSON conforming to `schema`.
    async fn generate_structured(
        &self,
        prompt: &Prompt,
        schema: &serde_json::Value,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Response>;
}
