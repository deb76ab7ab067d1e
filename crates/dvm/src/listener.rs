//! Job listener
//!
//! Subscribes to the transport for job requests, drops duplicates and
//! messages for other providers, validates the rest, and hands admitted
//! [`JobRequest`]s to the orchestrator over a channel. When the subscription
//! is lost it resubscribes with exponential backoff. Requests published while
//! disconnected may be missed.

use crate::config::DvmConfig;
use crate::error::AdmissionError;
use crate::event::{Event, unix_now, verify_event};
use crate::events::EngineEvent;
use crate::job::{JobRequest, short_id};
use crate::nip90::{ValidationError, is_addressed_to, parse_job_request};
use crate::task::sleep_or_cancel;
use crate::telemetry::{Telemetry, categories};
use crate::transport::{Filter, Transport};
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Bounded memory of recently seen message ids, oldest evicted first.
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Remember `id`. Returns `false` if it was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct JobListener {
    config: Arc<DvmConfig>,
    node_pubkey: String,
    transport: Arc<dyn Transport>,
    telemetry: Arc<dyn Telemetry>,
    events: broadcast::Sender<EngineEvent>,
    recent: RecentIds,
}

impl JobListener {
    pub fn new(
        config: Arc<DvmConfig>,
        node_pubkey: impl Into<String>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn Telemetry>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let recent = RecentIds::new(config.dedup_window);
        Self {
            config,
            node_pubkey: node_pubkey.into(),
            transport,
            telemetry,
            events,
            recent,
        }
    }

    /// Subscription filter for the kinds this node serves.
    pub fn filter(&self) -> Filter {
        Filter::new()
            .kinds(
                self.config
                    .supported_kinds
                    .iter()
                    .copied()
                    .filter(|kind| self.config.accepts_kind(*kind)),
            )
            .since(unix_now())
    }

    /// Decide whether `event` becomes a job.
    ///
    /// Validation failures and denied kinds are recorded via telemetry.
    /// Duplicates and requests addressed to other providers are dropped
    /// silently.
    pub fn admit(&mut self, event: &Event) -> Result<JobRequest, AdmissionError> {
        let result = self.check(event);
        match &result {
            Ok(request) => {
                tracing::debug!(job_id = %request.short_id(), kind = request.job_kind, "request admitted");
            }
            Err(err @ AdmissionError::Invalid(reason)) => {
                tracing::warn!(event_id = %short_id(&event.id), "rejected job request: {err}");
                self.telemetry.record(
                    categories::LISTENER,
                    "validation_failed",
                    Some(&reason.to_string()),
                    None,
                );
            }
            Err(AdmissionError::Denied(kind)) => {
                tracing::debug!(event_id = %short_id(&event.id), kind, "job kind not served");
                self.telemetry.record(
                    categories::LISTENER,
                    "admission_denied",
                    Some(&kind.to_string()),
                    None,
                );
            }
            Err(err) => {
                tracing::trace!(event_id = %short_id(&event.id), "ignored: {err}");
            }
        }
        result
    }

    fn check(&mut self, event: &Event) -> Result<JobRequest, AdmissionError> {
        if self.recent.contains(&event.id) {
            return Err(AdmissionError::Duplicate(event.id.clone()));
        }
        if !is_addressed_to(event, &self.node_pubkey) {
            return Err(AdmissionError::NotAddressed);
        }
        if !self.config.accepts_kind(event.kind) {
            return Err(AdmissionError::Denied(event.kind));
        }
        match verify_event(event) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(ValidationError::InvalidSignature.into()),
        }
        // Only verified ids enter the dedup window.
        self.recent.insert(&event.id);
        Ok(parse_job_request(event)?)
    }

    /// Listen until `cancel` fires or the receiving side of `sink` closes.
    pub async fn run(mut self, sink: mpsc::Sender<JobRequest>, cancel: CancellationToken) {
        let relays = self.config.relays.clone();
        let mut backoff = self.config.reconnect_retry.backoff(0);

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.transport.subscribe(&relays, self.filter()) => result,
            };

            let reason = match subscribed {
                Ok(mut stream) => {
                    tracing::info!(relays = relays.len(), "subscribed for job requests");
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                backoff.reset();
                                let Ok(request) = self.admit(&event) else {
                                    continue;
                                };
                                if sink.send(request).await.is_err() {
                                    tracing::debug!("job sink closed, listener exiting");
                                    return;
                                }
                            }
                            Some(Err(e)) => break e.to_string(),
                            None => break "subscription closed".to_string(),
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            let Some(delay) = backoff.next_delay() else {
                return;
            };
            tracing::warn!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "subscription lost: {reason}"
            );
            let _ = self.events.send(EngineEvent::ListenerReconnecting {
                attempt: backoff.attempt(),
                delay_ms: delay.as_millis() as u64,
                reason,
                timestamp: Utc::now(),
            });
            if !sleep_or_cancel(&cancel, delay).await {
                return;
            }
        }
    }
}
