//! Inference executor
//!
//! Turns an admitted [`JobRequest`] into a provider call. The job kind picks a
//! [`JobFamily`], which owns prompt assembly and result encoding; request
//! params pick the [`ExecutionMode`]. Every call runs under the configured
//! maximum duration and a cancellation token that reaches the provider, so a
//! timeout or shutdown aborts the underlying request.

use crate::job::JobRequest;
use crate::nip90::{
    InputType, JobInput, KIND_JOB_SUMMARIZATION, KIND_JOB_TEXT_EXTRACTION,
    KIND_JOB_TEXT_GENERATION, KIND_JOB_TRANSLATION,
};
use crate::provider::{
    GenerationOptions, InferenceProvider, Prompt, ProviderError, TextChunk, Usage,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("request refused by content policy: {0}")]
    ContentPolicy(String),

    #[error("input too large for the model context: {0}")]
    ContextTooLarge(String),

    #[error("inference timed out")]
    Timeout,

    #[error("inference cancelled")]
    Cancelled,

    #[error("inference failed: {0}")]
    Unknown(String),
}

impl From<ProviderError> for InferenceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => InferenceError::ProviderUnavailable(msg),
            ProviderError::ContentPolicy(msg) => InferenceError::ContentPolicy(msg),
            ProviderError::ContextTooLarge(msg) => InferenceError::ContextTooLarge(msg),
            ProviderError::Timeout => InferenceError::Timeout,
            ProviderError::Cancelled => InferenceError::Cancelled,
            ProviderError::Http { status, body } if status >= 500 => {
                InferenceError::ProviderUnavailable(format!("HTTP {status}: {body}"))
            }
            other => InferenceError::Unknown(other.to_string()),
        }
    }
}

/// Prompt-assembly and result-encoding strategy for a group of job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFamily {
    TextExtraction,
    Summarization,
    Translation,
    /// Free-form generation; also serves configured kinds without a family
    TextGeneration,
}

impl JobFamily {
    pub fn for_kind(kind: u16) -> Self {
        match kind {
            KIND_JOB_TEXT_EXTRACTION => JobFamily::TextExtraction,
            KIND_JOB_SUMMARIZATION => JobFamily::Summarization,
            KIND_JOB_TRANSLATION => JobFamily::Translation,
            KIND_JOB_TEXT_GENERATION => JobFamily::TextGeneration,
            _ => JobFamily::TextGeneration,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobFamily::TextExtraction => "text-extraction",
            JobFamily::Summarization => "summarization",
            JobFamily::Translation => "translation",
            JobFamily::TextGeneration => "text-generation",
        }
    }

    pub fn build_prompt(&self, request: &JobRequest) -> Prompt {
        let input = render_inputs(&request.inputs);
        let prompt = match self {
            JobFamily::TextExtraction => Prompt::new(input).with_system(
                "Extract the readable text from the input. Reply with the extracted text only.",
            ),
            JobFamily::Summarization => {
                let mut user = String::from("Summarize the following");
                if let Some(length) = request.param("length") {
                    user.push_str(&format!(" in at most {length} words"));
                }
                user.push_str(":\n\n");
                user.push_str(&input);
                Prompt::new(user).with_system("You write concise, faithful summaries.")
            }
            JobFamily::Translation => {
                let language = request.param("language").unwrap_or("en");
                Prompt::new(format!(
                    "Translate the following text into {language}:\n\n{input}"
                ))
                .with_system("You are a translator. Reply with the translation only.")
            }
            JobFamily::TextGeneration => Prompt::new(input),
        };

        match request.param("system") {
            Some(system) => prompt.with_system(system),
            None => prompt,
        }
    }

    pub fn encode_result(&self, text: &str) -> String {
        match self {
            JobFamily::TextGeneration => text.to_string(),
            JobFamily::TextExtraction | JobFamily::Summarization | JobFamily::Translation => {
                text.trim().to_string()
            }
        }
    }
}

fn render_inputs(inputs: &[JobInput]) -> String {
    inputs
        .iter()
        .map(|input| match input.input_type {
            InputType::Text => input.data.clone(),
            InputType::Url => format!("URL: {}", input.data),
            InputType::Event => format!("Nostr event: {}", input.data),
            InputType::Job => format!("Output of job: {}", input.data),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// How the provider is called for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    Batch,
    /// `param stream true`
    Streaming,
    /// `output application/json` with a `param schema`
    Structured(serde_json::Value),
}

impl ExecutionMode {
    pub fn for_request(request: &JobRequest) -> Result<Self, InferenceError> {
        if request.output.as_deref() == Some("application/json") {
            if let Some(raw) = request.param("schema") {
                let schema = serde_json::from_str(raw)
                    .map_err(|e| InferenceError::Unknown(format!("invalid schema param: {e}")))?;
                return Ok(ExecutionMode::Structured(schema));
            }
        }
        match request.param("stream") {
            Some(flag) if flag.eq_ignore_ascii_case("true") => Ok(ExecutionMode::Streaming),
            _ => Ok(ExecutionMode::Batch),
        }
    }
}

/// Successful inference output, already encoded for the result message.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
    /// Chunks received (streaming mode only)
    pub chunks: usize,
}

/// Receives partial output while a streaming job runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn partial(&self, request: &JobRequest, content: &str);
}

pub type ChunkStream = BoxStream<'static, Result<TextChunk, InferenceError>>;

pub struct InferenceExecutor {
    provider: Arc<dyn InferenceProvider>,
    default_model: String,
    timeout: Duration,
    feedback_every: usize,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl InferenceExecutor {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
            timeout,
            feedback_every: 0,
            progress: None,
        }
    }

    /// Report partial output to `sink` every `every` chunks.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>, every: usize) -> Self {
        self.progress = Some(sink);
        self.feedback_every = every;
        self
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn options_for(&self, request: &JobRequest) -> GenerationOptions {
        GenerationOptions {
            model: request
                .param("model")
                .map(str::to_string)
                .unwrap_or_else(|| self.default_model.clone()),
            max_tokens: request.param("max_tokens").and_then(|v| v.parse().ok()),
            temperature: request.param("temperature").and_then(|v| v.parse().ok()),
            top_p: request.param("top_p").and_then(|v| v.parse().ok()),
        }
    }

    /// Run the job to completion.
    ///
    /// A failure part-way through a stream discards everything received so
    /// far.
    pub async fn execute(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<InferenceOutput, InferenceError> {
        let family = JobFamily::for_kind(request.job_kind);
        let mode = ExecutionMode::for_request(request)?;
        let prompt = family.build_prompt(request);
        let options = self.options_for(request);

        tracing::debug!(
            job_id = %request.short_id(),
            family = family.name(),
            ?mode,
            model = %options.model,
            provider = self.provider.id(),
            "starting inference"
        );

        // Child token so a timeout aborts the provider call without touching
        // the caller's token.
        let call = cancel.child_token();
        let work = async {
            let output: Result<InferenceOutput, InferenceError> = match &mode {
                ExecutionMode::Batch => {
                    let response = self.provider.generate_text(&prompt, &options, &call).await?;
                    Ok(InferenceOutput {
                        content: family.encode_result(&response.text),
                        model: response.model,
                        usage: response.usage,
                        chunks: 0,
                    })
                }
                ExecutionMode::Structured(schema) => {
                    let response = self
                        .provider
                        .generate_structured(&prompt, schema, &options, &call)
                        .await?;
                    let content = response.text.trim().to_string();
                    serde_json::from_str::<serde_json::Value>(&content).map_err(|e| {
                        InferenceError::Unknown(format!("provider returned invalid JSON: {e}"))
                    })?;
                    Ok(InferenceOutput {
                        content,
                        model: response.model,
                        usage: response.usage,
                        chunks: 0,
                    })
                }
                ExecutionMode::Streaming => {
                    self.collect_stream(request, family, &prompt, &options, &call)
                        .await
                }
            };
            output
        };

        let result = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                call.cancel();
                tracing::warn!(
                    job_id = %request.short_id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "inference timed out"
                );
                Err(InferenceError::Timeout)
            }
        };

        if cancel.is_cancelled() && result.is_err() {
            return Err(InferenceError::Cancelled);
        }
        result
    }

    /// Raw chunk stream for `request`, errors normalized.
    ///
    /// Single use. Ends early when `cancel` fires.
    pub async fn execute_streaming(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, InferenceError> {
        let family = JobFamily::for_kind(request.job_kind);
        let prompt = family.build_prompt(request);
        let options = self.options_for(request);
        let stream = self.provider.stream_text(&prompt, &options, cancel).await?;
        Ok(Box::pin(stream.map(|chunk| chunk.map_err(InferenceError::from))))
    }

    async fn collect_stream(
        &self,
        request: &JobRequest,
        family: JobFamily,
        prompt: &Prompt,
        options: &GenerationOptions,
        call: &CancellationToken,
    ) -> Result<InferenceOutput, InferenceError> {
        let mut stream = self
            .provider
            .stream_text(prompt, options, call)
            .await
            .map_err(InferenceError::from)?;

        let mut content = String::new();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::warn!(job_id = %request.short_id(), chunks, "stream failed: {e}");
                InferenceError::from(e)
            })?;
            content.push_str(&chunk.delta);
            chunks += 1;

            if self.feedback_every > 0 && chunks % self.feedback_every == 0 {
                if let Some(progress) = &self.progress {
                    progress.partial(request, &content).await;
                }
            }
        }

        // A cancelled stream ends quietly; its output is incomplete.
        if call.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }

        Ok(InferenceOutput {
            content: family.encode_result(&content),
            model: options.model.clone(),
            usage: None,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip90::JobParam;
    use crate::tests::fakes::{FakeProvider, RecordingProgress};
    use crate::tests::fixtures::job_request;
    use pretty_assertions::assert_eq;

    fn with_params(kind: u16, text: &str, params: &[(&str, &str)]) -> JobRequest {
        let mut request = job_request(kind, text);
        request.params = params
            .iter()
            .map(|(k, v)| JobParam::new(*k, *v))
            .collect();
        request
    }

    #[test]
    fn test_family_table() {
        assert_eq!(JobFamily::for_kind(5000), JobFamily::TextExtraction);
        assert_eq!(JobFamily::for_kind(5001), JobFamily::Summarization);
        assert_eq!(JobFamily::for_kind(5002), JobFamily::Translation);
        assert_eq!(JobFamily::for_kind(5050), JobFamily::TextGeneration);
        assert_eq!(JobFamily::for_kind(5100), JobFamily::TextGeneration);
    }

    #[test]
    fn test_translation_prompt_uses_language_param() {
        let request = with_params(5002, "Hola", &[("language", "fr")]);
        let prompt = JobFamily::Translation.build_prompt(&request);
        assert!(prompt.user.contains("into fr"));
        assert!(prompt.user.ends_with("Hola"));
        assert!(prompt.system.is_some());
    }

    #[test]
    fn test_execution_mode() {
        let request = job_request(5050, "hi");
        assert_eq!(ExecutionMode::for_request(&request).unwrap(), ExecutionMode::Batch);

        let request = with_params(5050, "hi", &[("stream", "true")]);
        assert_eq!(
            ExecutionMode::for_request(&request).unwrap(),
            ExecutionMode::Streaming
        );

        let mut request = with_params(5050, "hi", &[("schema", r#"{"type":"object"}"#)]);
        request.output = Some("application/json".into());
        assert!(matches!(
            ExecutionMode::for_request(&request).unwrap(),
            ExecutionMode::Structured(_)
        ));

        request.params = vec![JobParam::new("schema", "{not json")];
        assert!(ExecutionMode::for_request(&request).is_err());
    }

    #[test]
    fn test_options_from_params() {
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::replying("x")),
            "default-model",
            Duration::from_secs(1),
        );
        let request = with_params(5050, "hi", &[("max_tokens", "64"), ("temperature", "0.5")]);
        let options = executor.options_for(&request);
        assert_eq!(options.model, "default-model");
        assert_eq!(options.max_tokens, Some(64));
        assert_eq!(options.temperature, Some(0.5));
    }

    #[tokio::test]
    async fn test_batch_execution() {
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::replying("Hello")),
            "m",
            Duration::from_secs(5),
        );
        let output = executor
            .execute(&job_request(5050, "hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.content, "Hello");
    }

    #[tokio::test]
    async fn test_provider_errors_are_normalized() {
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::failing(ProviderError::Unavailable("offline".into()))),
            "m",
            Duration::from_secs(5),
        );
        let err = executor
            .execute(&job_request(5050, "hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, InferenceError::ProviderUnavailable("offline".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_provider_call() {
        let provider = Arc::new(FakeProvider::hanging());
        let executor =
            InferenceExecutor::new(provider.clone(), "m", Duration::from_millis(100));
        let err = executor
            .execute(&job_request(5050, "hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, InferenceError::Timeout);
        assert!(provider.saw_cancellation());
    }

    #[tokio::test]
    async fn test_caller_cancel_is_reported() {
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::hanging()),
            "m",
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = executor
            .execute(&job_request(5050, "hi"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, InferenceError::Cancelled);
    }

    #[tokio::test]
    async fn test_streaming_reports_progress() {
        let progress = Arc::new(RecordingProgress::default());
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::streaming(&["a", "b", "c", "d", "e"])),
            "m",
            Duration::from_secs(5),
        )
        .with_progress(progress.clone(), 2);

        let request = with_params(5050, "hi", &[("stream", "true")]);
        let output = executor
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.content, "abcde");
        assert_eq!(output.chunks, 5);
        assert_eq!(progress.partials(), vec!["ab".to_string(), "abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_discards_partial_output() {
        let progress = Arc::new(RecordingProgress::default());
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::streaming_then_failing(
                &["a", "b"],
                ProviderError::Stream("connection reset".into()),
            )),
            "m",
            Duration::from_secs(5),
        )
        .with_progress(progress.clone(), 1);

        let request = with_params(5050, "hi", &[("stream", "true")]);
        let err = executor
            .execute(&request, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::Unknown(_)));
        assert_eq!(progress.partials().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_streaming_yields_chunks() {
        let executor = InferenceExecutor::new(
            Arc::new(FakeProvider::streaming(&["x", "y"])),
            "m",
            Duration::from_secs(5),
        );
        let stream = executor
            .execute_streaming(&job_request(5050, "hi"), &CancellationToken::new())
            .await
            .unwrap();
        let deltas: Vec<String> = stream.map(|c| c.unwrap().delta).collect().await;
        assert_eq!(deltas, vec!["x", "y"]);
    }
}
