//! Invoice monitor
//!
//! One background task per job awaiting payment. Each task polls the payment
//! collaborator until the invoice is paid, the payment window closes, the
//! status checks keep failing, or the task is cancelled. Outcomes are
//! committed through the registry; the orchestrator reacts to the returned
//! [`MonitorOutcome`].

use crate::backoff::RetryPolicy;
use crate::error::{DvmError, ErrorKind, JobError};
use crate::events::EngineEvent;
use crate::job::{JobState, JobStatus, short_id};
use crate::payment::{Invoice, InvoiceStatus, PaymentProvider};
use crate::registry::JobRegistry;
use crate::task::{ScheduledTask, sleep_or_cancel};
use crate::telemetry::{Telemetry, categories};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How a monitor task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Job moved to `Paid`
    Paid,
    /// Job moved to `Expired`
    Expired,
    /// Job moved to `Failed` after too many status check errors
    Failed,
    /// Stopped without touching the job
    Cancelled,
}

pub struct MonitorHandle {
    job_id: String,
    task: ScheduledTask<MonitorOutcome>,
}

impl MonitorHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> MonitorOutcome {
        self.task.join().await.unwrap_or(MonitorOutcome::Cancelled)
    }
}

#[derive(Clone)]
pub struct InvoiceMonitor {
    registry: Arc<JobRegistry>,
    payments: Arc<dyn PaymentProvider>,
    telemetry: Arc<dyn Telemetry>,
    events: broadcast::Sender<EngineEvent>,
    tracker: TaskTracker,
    live: Arc<DashMap<String, CancellationToken>>,
    max_poll_failures: u32,
    poll_retry: RetryPolicy,
}

impl InvoiceMonitor {
    pub fn new(
        registry: Arc<JobRegistry>,
        payments: Arc<dyn PaymentProvider>,
        telemetry: Arc<dyn Telemetry>,
        events: broadcast::Sender<EngineEvent>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            registry,
            payments,
            telemetry,
            events,
            tracker,
            live: Arc::new(DashMap::new()),
            max_poll_failures: 5,
            poll_retry: RetryPolicy::new(500, 10_000),
        }
    }

    pub fn with_retry(mut self, max_poll_failures: u32, poll_retry: RetryPolicy) -> Self {
        self.max_poll_failures = max_poll_failures;
        self.poll_retry = poll_retry;
        self
    }

    /// Start polling `invoice` for `job_id`.
    ///
    /// Fails if a monitor is already live for this job.
    pub fn start(
        &self,
        job_id: &str,
        invoice: Invoice,
        poll_interval: Duration,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Result<MonitorHandle, DvmError> {
        let slot = match self.live.entry(job_id.to_string()) {
            Entry::Occupied(_) => return Err(DvmError::MonitorAlreadyRunning(job_id.to_string())),
            Entry::Vacant(slot) => slot,
        };

        let poller = Poller {
            job_id: job_id.to_string(),
            invoice,
            poll_interval,
            timeout,
            monitor: self.clone(),
        };
        let task = ScheduledTask::spawn(&self.tracker, parent, |token| poller.run(token));
        slot.insert(task.token().clone());

        tracing::debug!(job_id = %short_id(job_id), "invoice monitor started");
        Ok(MonitorHandle {
            job_id: job_id.to_string(),
            task,
        })
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.live.contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.live.len()
    }

    /// Cancel every live monitor.
    pub fn cancel_all(&self) {
        for entry in self.live.iter() {
            entry.value().cancel();
        }
    }

    /// Commit the final transition and unregister in the same critical
    /// section, so no observer sees the job leave `AwaitingPayment` while its
    /// monitor is still registered.
    fn finish<F>(&self, job_id: &str, to: JobStatus, patch: F) -> Option<JobState>
    where
        F: FnOnce(&mut JobState),
    {
        let result = self
            .registry
            .transition(job_id, JobStatus::AwaitingPayment, to, |state| {
                patch(state);
                self.live.remove(job_id);
            });
        match result {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!(job_id = %short_id(job_id), "monitor result not applied: {e}");
                None
            }
        }
    }
}

/// Removes the live entry however the task ends.
struct LiveGuard {
    live: Arc<DashMap<String, CancellationToken>>,
    job_id: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.remove(&self.job_id);
    }
}

struct Poller {
    job_id: String,
    invoice: Invoice,
    poll_interval: Duration,
    timeout: Duration,
    monitor: InvoiceMonitor,
}

impl Poller {
    async fn run(self, token: CancellationToken) -> MonitorOutcome {
        let _guard = LiveGuard {
            live: self.monitor.live.clone(),
            job_id: self.job_id.clone(),
        };
        let outcome = self.poll(&token).await;
        tracing::debug!(job_id = %short_id(&self.job_id), ?outcome, "invoice monitor stopped");
        outcome
    }

    async fn poll(&self, token: &CancellationToken) -> MonitorOutcome {
        let monitor = &self.monitor;
        let deadline = Instant::now() + self.timeout;
        let mut backoff = monitor.poll_retry.backoff(0);
        let mut failures = 0u32;
        let mut delay = self.poll_interval;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.expire();
            }
            if !sleep_or_cancel(token, delay.min(remaining)).await {
                return MonitorOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                return self.expire();
            }

            let checked = tokio::select! {
                _ = token.cancelled() => return MonitorOutcome::Cancelled,
                checked = monitor.payments.check_status(&self.invoice.payment_hash) => checked,
            };

            match checked {
                Ok(InvoiceStatus::Paid) => return self.paid(),
                Ok(InvoiceStatus::Expired) => return self.expire(),
                Ok(InvoiceStatus::Pending) => {
                    failures = 0;
                    backoff.reset();
                    delay = self.poll_interval;
                }
                Err(e) => {
                    failures += 1;
                    let _ = monitor.registry.update(&self.job_id, |state| {
                        state.attempts.payment_poll_failures = failures;
                    });
                    if failures > monitor.max_poll_failures {
                        return self.fail(e.to_string());
                    }
                    delay = backoff.next_delay().unwrap_or(self.poll_interval);
                    tracing::warn!(
                        job_id = %short_id(&self.job_id),
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "payment status check failed: {e}"
                    );
                }
            }
        }
    }

    fn paid(&self) -> MonitorOutcome {
        let monitor = &self.monitor;
        if monitor
            .finish(&self.job_id, JobStatus::Paid, |state| {
                if let Some(invoice) = state.invoice.as_mut() {
                    invoice.status = InvoiceStatus::Paid;
                }
            })
            .is_none()
        {
            return MonitorOutcome::Cancelled;
        }

        tracing::info!(
            job_id = %short_id(&self.job_id),
            amount_msats = self.invoice.amount_msats,
            "payment received"
        );
        monitor.telemetry.record(
            categories::PAYMENT,
            "payment_received",
            None,
            Some(self.invoice.amount_msats as f64),
        );
        let _ = monitor.events.send(EngineEvent::PaymentReceived {
            job_id: self.job_id.clone(),
            amount_msats: self.invoice.amount_msats,
            timestamp: Utc::now(),
        });
        MonitorOutcome::Paid
    }

    fn expire(&self) -> MonitorOutcome {
        let applied = self.monitor.finish(&self.job_id, JobStatus::Expired, |state| {
            if let Some(invoice) = state.invoice.as_mut() {
                invoice.status = InvoiceStatus::Expired;
            }
            state.last_error = Some(JobError::new(
                ErrorKind::PaymentTimeout,
                "invoice was not paid before the payment window closed",
            ));
        });
        match applied {
            Some(_) => {
                tracing::info!(job_id = %short_id(&self.job_id), "invoice expired");
                MonitorOutcome::Expired
            }
            None => MonitorOutcome::Cancelled,
        }
    }

    fn fail(&self, reason: String) -> MonitorOutcome {
        let applied = self.monitor.finish(&self.job_id, JobStatus::Failed, |state| {
            state.last_error = Some(JobError::new(
                ErrorKind::PaymentCheck,
                format!("payment status unavailable: {reason}"),
            ));
        });
        match applied {
            Some(_) => {
                tracing::error!(job_id = %short_id(&self.job_id), "giving up on payment checks: {reason}");
                MonitorOutcome::Failed
            }
            None => MonitorOutcome::Cancelled,
        }
    }
}
