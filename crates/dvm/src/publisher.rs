//! Result publisher
//!
//! Signs and publishes result (kind 6xxx) and feedback (kind 7000) messages.
//!
//! Results are published at most once per job: the publisher claims the job's
//! publication slot in the registry before the first attempt and sets
//! `result_published` only once a relay confirmed the event. Transient
//! transport failures are retried with backoff; rejections are not.
//! Feedback is best effort: one attempt, failures are logged and returned.

use crate::backoff::RetryPolicy;
use crate::event::{Event, Keys};
use crate::events::EngineEvent;
use crate::executor::ProgressSink;
use crate::job::{JobRequest, short_id};
use crate::nip90::{FeedbackStatus, feedback_template, result_template};
use crate::registry::{JobRegistry, PublishClaim, RegistryError};
use crate::task::sleep_or_cancel;
use crate::telemetry::{Telemetry, categories};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish failed after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },

    #[error("event rejected: {0}")]
    Rejected(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("publisher is closed")]
    Stopped,

    #[error("unknown job {0}")]
    UnknownJob(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient { .. })
    }
}

impl From<RegistryError> for PublishError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(job_id) => PublishError::UnknownJob(job_id),
            other => PublishError::Rejected(other.to_string()),
        }
    }
}

/// A feedback message to send for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub status: FeedbackStatus,
    pub extra_info: Option<String>,
    pub content: String,
    pub amount: Option<(u64, Option<String>)>,
}

impl Feedback {
    pub fn new(status: FeedbackStatus) -> Self {
        Self {
            status,
            extra_info: None,
            content: String::new(),
            amount: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.extra_info = Some(info.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_amount(mut self, msats: u64, invoice: Option<String>) -> Self {
        self.amount = Some((msats, invoice));
        self
    }
}

pub struct ResultPublisher {
    keys: Keys,
    transport: Arc<dyn Transport>,
    registry: Arc<JobRegistry>,
    telemetry: Arc<dyn Telemetry>,
    events: broadcast::Sender<EngineEvent>,
    relays: Vec<String>,
    max_attempts: u32,
    retry: RetryPolicy,
    closed: CancellationToken,
}

impl ResultPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Keys,
        transport: Arc<dyn Transport>,
        registry: Arc<JobRegistry>,
        telemetry: Arc<dyn Telemetry>,
        events: broadcast::Sender<EngineEvent>,
        relays: Vec<String>,
        max_attempts: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            keys,
            transport,
            registry,
            telemetry,
            events,
            relays,
            max_attempts: max_attempts.max(1),
            retry,
            closed: CancellationToken::new(),
        }
    }

    pub fn public_key(&self) -> &str {
        self.keys.public_key()
    }

    /// Refuse every publish from now on. Retries in progress stop at their
    /// next backoff sleep.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Publish the result of `job_id` with `content`.
    ///
    /// A no-op returning `Ok` if the result was already published or another
    /// caller is publishing it right now.
    pub async fn publish_result(&self, job_id: &str, content: &str) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Stopped);
        }

        match self.registry.claim_result_publication(job_id)? {
            PublishClaim::Claimed => {}
            PublishClaim::AlreadyPublished | PublishClaim::InFlight => {
                tracing::debug!(job_id = %short_id(job_id), "result already published");
                return Ok(());
            }
        }

        let outcome = self.publish_claimed(job_id, content).await;
        let published = outcome.is_ok();
        if let Err(e) = self.registry.release_result_publication(job_id, published) {
            tracing::error!(job_id = %short_id(job_id), "failed to release publish claim: {e}");
        }

        match outcome {
            Ok(event) => {
                tracing::info!(job_id = %short_id(job_id), event_id = %short_id(&event.id), "result published");
                self.telemetry
                    .record(categories::PUBLISH, "result_published", None, None);
                let _ = self.events.send(EngineEvent::ResultPublished {
                    job_id: job_id.to_string(),
                    event_id: event.id,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!(job_id = %short_id(job_id), "result publish failed: {e}");
                self.telemetry.record(
                    categories::PUBLISH,
                    "result_publish_failed",
                    Some(&e.to_string()),
                    None,
                );
                Err(e)
            }
        }
    }

    async fn publish_claimed(&self, job_id: &str, content: &str) -> Result<Event, PublishError> {
        let state = self
            .registry
            .get(job_id)
            .ok_or_else(|| PublishError::UnknownJob(job_id.to_string()))?;

        let amount = state
            .invoice
            .as_ref()
            .map(|invoice| (invoice.amount_msats, Some(invoice.encoded_invoice.as_str())));
        let template = result_template(&state.request, content, amount);
        let event = self
            .keys
            .sign(&template)
            .map_err(|e| PublishError::Signing(e.to_string()))?;
        let relays = self.relays_for(&state.request);

        let mut backoff = self.retry.backoff(0);
        let mut attempts = 0u32;
        loop {
            if self.is_closed() {
                return Err(PublishError::Stopped);
            }
            attempts += 1;
            let _ = self.registry.update(job_id, |state| {
                state.attempts.publish = attempts;
            });

            let reason = match self.transport.publish(&event, &relays).await {
                Ok(()) => return Ok(event),
                Err(TransportError::Rejected(reason)) => {
                    return Err(PublishError::Rejected(reason));
                }
                Err(e) => e.to_string(),
            };

            if attempts >= self.max_attempts {
                return Err(PublishError::Transient { attempts, reason });
            }
            let delay = backoff.next_delay().unwrap_or_default();
            tracing::warn!(
                job_id = %short_id(job_id),
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                "result publish failed: {reason}"
            );
            if !sleep_or_cancel(&self.closed, delay).await {
                return Err(PublishError::Stopped);
            }
        }
    }

    /// Publish a feedback message for `job_id`. Single attempt.
    pub async fn publish_feedback(
        &self,
        job_id: &str,
        feedback: Feedback,
    ) -> Result<(), PublishError> {
        let state = self
            .registry
            .get(job_id)
            .ok_or_else(|| PublishError::UnknownJob(job_id.to_string()))?;
        self.send_feedback(&state.request, feedback).await
    }

    async fn send_feedback(
        &self,
        request: &JobRequest,
        feedback: Feedback,
    ) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Stopped);
        }

        let amount = feedback
            .amount
            .as_ref()
            .map(|(msats, invoice)| (*msats, invoice.as_deref()));
        let template = feedback_template(
            request,
            feedback.status,
            feedback.extra_info.as_deref(),
            &feedback.content,
            amount,
        );
        let event = self
            .keys
            .sign(&template)
            .map_err(|e| PublishError::Signing(e.to_string()))?;

        match self
            .transport
            .publish(&event, &self.relays_for(request))
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    job_id = %request.short_id(),
                    status = feedback.status.as_str(),
                    "feedback published"
                );
                let _ = self.events.send(EngineEvent::FeedbackPublished {
                    job_id: request.id.clone(),
                    status: feedback.status,
                    event_id: event.id,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %request.short_id(),
                    status = feedback.status.as_str(),
                    "feedback publish failed: {e}"
                );
                Err(match e {
                    TransportError::Rejected(reason) => PublishError::Rejected(reason),
                    other => PublishError::Transient {
                        attempts: 1,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Configured relays plus the requester's relay hints.
    fn relays_for(&self, request: &JobRequest) -> Vec<String> {
        let mut relays = self.relays.clone();
        for hint in &request.relay_hints {
            if !relays.contains(hint) {
                relays.push(hint.clone());
            }
        }
        relays
    }
}

#[async_trait]
impl ProgressSink for ResultPublisher {
    async fn partial(&self, request: &JobRequest, content: &str) {
        let feedback = Feedback::new(FeedbackStatus::Processing).with_content(content);
        let _ = self.send_feedback(request, feedback).await;
    }
}
