//! Job orchestrator
//!
//! [`DvmEngine`] drives every admitted job through its lifecycle:
//!
//! ```text
//! free:  Received -> Processing -> Completed | Failed
//! paid:  Received -> AwaitingPayment -> Paid -> Processing -> Completed | Failed
//!                                    -> Expired | Failed | Cancelled
//! ```
//!
//! Each job runs as its own task on the engine's [`TaskTracker`], so jobs
//! progress independently and `stop()` can account for all of them.

use crate::config::DvmConfig;
use crate::error::{DvmError, ErrorKind, JobError, Result};
use crate::event::Keys;
use crate::events::EngineEvent;
use crate::executor::{InferenceError, InferenceExecutor};
use crate::job::{JobRequest, JobState, JobStatus, short_id};
use crate::listener::JobListener;
use crate::monitor::{InvoiceMonitor, MonitorOutcome};
use crate::nip90::FeedbackStatus;
use crate::payment::{Invoice, PaymentError, PaymentProvider};
use crate::provider::InferenceProvider;
use crate::publisher::{Feedback, ResultPublisher};
use crate::registry::JobRegistry;
use crate::task::sleep_or_cancel;
use crate::telemetry::{Telemetry, categories};
use crate::transport::Transport;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const ADMITTED_QUEUE_CAPACITY: usize = 256;

/// The DVM job-fulfillment engine.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct DvmEngine {
    core: Arc<Core>,
}

struct Core {
    config: Arc<DvmConfig>,
    keys: Keys,
    transport: Arc<dyn Transport>,
    payments: Option<Arc<dyn PaymentProvider>>,
    provider: Arc<dyn InferenceProvider>,
    telemetry: Arc<dyn Telemetry>,
    registry: Arc<JobRegistry>,
    events: broadcast::Sender<EngineEvent>,
    tracker: TaskTracker,
    running: RwLock<Option<Arc<Running>>>,
}

/// Everything that lives for one start/stop cycle.
struct Running {
    /// Listener, dispatch loop and eviction timers
    shutdown: CancellationToken,
    /// Invoice creation and monitors
    payments: CancellationToken,
    /// Inference and publication
    jobs: CancellationToken,
    publisher: Arc<ResultPublisher>,
    executor: Arc<InferenceExecutor>,
    monitor: Option<InvoiceMonitor>,
}

impl DvmEngine {
    /// Assemble an engine. Without a payment provider every job runs free.
    pub fn new(
        config: DvmConfig,
        transport: Arc<dyn Transport>,
        payments: Option<Arc<dyn PaymentProvider>>,
        provider: Arc<dyn InferenceProvider>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self> {
        config.validate()?;

        let keys = match &config.signing_key {
            Some(secret) => Keys::from_hex(secret.expose_secret())
                .map_err(|e| DvmError::Config(format!("signing_key: {e}")))?,
            None => {
                let keys = Keys::generate();
                tracing::warn!(
                    pubkey = %keys.public_key(),
                    "no signing key configured, using an ephemeral identity"
                );
                keys
            }
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(JobRegistry::new(events.clone()));

        Ok(Self {
            core: Arc::new(Core {
                config: Arc::new(config),
                keys,
                transport,
                payments,
                provider,
                telemetry,
                registry,
                events,
                tracker: TaskTracker::new(),
                running: RwLock::new(None),
            }),
        })
    }

    pub fn config(&self) -> &DvmConfig {
        &self.core.config
    }

    /// Hex public key results and feedback are signed with.
    pub fn public_key(&self) -> &str {
        self.core.keys.public_key()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.core.registry
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.core.running.read().await.is_some()
    }

    /// Jobs that have not reached a terminal status, oldest first.
    pub fn list_active_jobs(&self) -> Vec<JobState> {
        self.core.registry.list(|job| !job.is_terminal())
    }

    /// Number of background tasks owned by the engine.
    pub fn task_count(&self) -> usize {
        self.core.tracker.len()
    }

    /// Number of live invoice monitors.
    pub async fn active_monitors(&self) -> usize {
        match self.core.running.read().await.as_ref() {
            Some(run) => run.monitor.as_ref().map_or(0, InvoiceMonitor::active_count),
            None => 0,
        }
    }

    /// Start listening for job requests.
    pub async fn start(&self) -> Result<()> {
        let core = &self.core;
        let mut running = core.running.write().await;
        if running.is_some() {
            return Err(DvmError::AlreadyRunning);
        }

        if core.payments.is_none()
            && core
                .config
                .supported_kinds
                .iter()
                .any(|kind| core.config.price_for(*kind) > 0)
        {
            tracing::warn!("no payment provider configured, priced jobs will run for free");
        }

        core.tracker.reopen();
        let run = Arc::new(self.build_run());

        let listener = JobListener::new(
            core.config.clone(),
            core.keys.public_key(),
            core.transport.clone(),
            core.telemetry.clone(),
            core.events.clone(),
        );
        let (sink, admitted) = mpsc::channel(ADMITTED_QUEUE_CAPACITY);
        core.tracker
            .spawn(listener.run(sink, run.shutdown.child_token()));
        core.tracker
            .spawn(self.clone().dispatch(admitted, run.shutdown.clone()));

        *running = Some(run);
        drop(running);

        tracing::info!(
            pubkey = %core.keys.public_key(),
            relays = core.config.relays.len(),
            kinds = ?core.config.supported_kinds,
            provider = core.provider.id(),
            "DVM engine started"
        );
        let _ = core.events.send(EngineEvent::WentOnline {
            relays: core.config.relays.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn build_run(&self) -> Running {
        let core = &self.core;
        let config = &core.config;

        let publisher = Arc::new(ResultPublisher::new(
            core.keys.clone(),
            core.transport.clone(),
            core.registry.clone(),
            core.telemetry.clone(),
            core.events.clone(),
            config.relays.clone(),
            config.max_publish_attempts,
            config.publish_retry,
        ));
        let executor = Arc::new(
            InferenceExecutor::new(
                core.provider.clone(),
                config.default_model.clone(),
                config.inference_timeout(),
            )
            .with_progress(publisher.clone(), config.stream_feedback_every),
        );
        let monitor = core.payments.as_ref().map(|payments| {
            InvoiceMonitor::new(
                core.registry.clone(),
                payments.clone(),
                core.telemetry.clone(),
                core.events.clone(),
                core.tracker.clone(),
            )
            .with_retry(config.max_poll_failures, config.poll_retry)
        });

        Running {
            shutdown: CancellationToken::new(),
            payments: CancellationToken::new(),
            jobs: CancellationToken::new(),
            publisher,
            executor,
            monitor,
        }
    }

    async fn dispatch(self, mut admitted: mpsc::Receiver<JobRequest>, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = admitted.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.on_job_request(request).await {
                tracing::warn!("dropping admitted request: {e}");
            }
        }
    }

    /// Take ownership of an admitted request and start driving it.
    pub async fn on_job_request(&self, request: JobRequest) -> Result<JobState> {
        let core = &self.core;
        let run = core
            .running
            .read()
            .await
            .clone()
            .ok_or(DvmError::NotRunning)?;

        let request = Arc::new(request);
        let state = core.registry.create(request.clone())?;

        tracing::info!(
            job_id = %request.short_id(),
            kind = request.job_kind,
            requester = %short_id(&request.requester_key),
            "job received"
        );
        core.telemetry.record(
            categories::JOB,
            "job_received",
            Some(&request.job_kind.to_string()),
            None,
        );
        let _ = core.events.send(EngineEvent::JobReceived {
            job_id: request.id.clone(),
            kind: request.job_kind,
            requester: request.requester_key.clone(),
            timestamp: Utc::now(),
        });

        let driver = JobDriver {
            core: core.clone(),
            run,
            request,
        };
        core.tracker.spawn(driver.drive());
        Ok(state)
    }

    /// Stop the engine.
    ///
    /// The listener and invoice monitors stop at once and jobs awaiting
    /// payment are cancelled. Jobs already processing get the configured
    /// grace period to finish, then are cancelled without publishing. When
    /// this returns no engine task is left and nothing more is published.
    pub async fn stop(&self) -> Result<()> {
        let core = &self.core;
        let run = core
            .running
            .write()
            .await
            .take()
            .ok_or(DvmError::NotRunning)?;

        run.shutdown.cancel();
        run.payments.cancel();
        if let Some(monitor) = &run.monitor {
            monitor.cancel_all();
        }

        for job in core
            .registry
            .list(|job| job.status == JobStatus::AwaitingPayment)
        {
            let _ = core.registry.transition(
                &job.job_id,
                JobStatus::AwaitingPayment,
                JobStatus::Cancelled,
                |state| {
                    state.last_error =
                        Some(JobError::new(ErrorKind::Internal, "engine shut down"));
                },
            );
        }

        core.tracker.close();
        let grace = core.config.shutdown_grace();
        if tokio::time::timeout(grace, core.tracker.wait()).await.is_err() {
            tracing::warn!(
                in_flight = core.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "cancelling jobs still running after the shutdown grace period"
            );
        }
        run.publisher.close();
        run.jobs.cancel();
        core.tracker.wait().await;

        let evicted = core.registry.clear();
        tracing::info!(evicted, "DVM engine stopped");
        let _ = core.events.send(EngineEvent::WentOffline {
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Drives one job from `Received` to a terminal status.
struct JobDriver {
    core: Arc<Core>,
    run: Arc<Running>,
    request: Arc<JobRequest>,
}

impl JobDriver {
    fn job_id(&self) -> &str {
        &self.request.id
    }

    async fn drive(self) {
        let payment = match (&self.core.payments, &self.run.monitor) {
            (Some(payments), Some(monitor)) => self
                .core
                .config
                .required_payment(self.request.job_kind, &self.request.requester_key)
                .map(|amount| (payments.clone(), monitor.clone(), amount)),
            _ => None,
        };

        match payment {
            None => {
                if self.enter(JobStatus::Received, JobStatus::Processing) {
                    self.process().await;
                }
            }
            Some((payments, monitor, amount)) => {
                self.collect_payment(payments, monitor, amount).await;
            }
        }
    }

    fn enter(&self, from: JobStatus, to: JobStatus) -> bool {
        match self.core.registry.transition(self.job_id(), from, to, |_| {}) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(job_id = %self.request.short_id(), "job not advanced: {e}");
                false
            }
        }
    }

    async fn collect_payment(
        &self,
        payments: Arc<dyn PaymentProvider>,
        monitor: InvoiceMonitor,
        amount_msats: u64,
    ) {
        let token = self.run.payments.child_token();
        let invoice = match self.create_invoice(payments.as_ref(), amount_msats, &token).await {
            Ok(Some(_)) if token.is_cancelled() => return,
            Ok(Some(invoice)) => invoice,
            Ok(None) => return,
            Err(e) => {
                self.fail(
                    JobStatus::Received,
                    JobError::new(ErrorKind::Payment, format!("could not create invoice: {e}")),
                )
                .await;
                return;
            }
        };

        let attached = invoice.clone();
        if let Err(e) = self.core.registry.transition(
            self.job_id(),
            JobStatus::Received,
            JobStatus::AwaitingPayment,
            move |state| state.invoice = Some(attached),
        ) {
            tracing::debug!(job_id = %self.request.short_id(), "invoice not attached: {e}");
            return;
        }
        self.core.telemetry.record(
            categories::PAYMENT,
            "invoice_created",
            None,
            Some(amount_msats as f64),
        );
        let _ = self.core.events.send(EngineEvent::InvoiceCreated {
            job_id: self.job_id().to_string(),
            amount_msats,
            timestamp: Utc::now(),
        });

        let handle = match monitor.start(
            self.job_id(),
            invoice.clone(),
            self.core.config.poll_interval(),
            self.core.config.payment_timeout(),
            &self.run.payments,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(job_id = %self.request.short_id(), "{e}");
                return;
            }
        };

        // stop() may have cancelled the job since the monitor started.
        if self.run.payments.is_cancelled()
            || self.core.registry.status(self.job_id()) == Some(JobStatus::Cancelled)
        {
            let _ = handle.join().await;
            return;
        }
        let _ = self
            .run
            .publisher
            .publish_feedback(
                self.job_id(),
                Feedback::new(FeedbackStatus::PaymentRequired)
                    .with_content(format!("Pay {} sats to run this job", amount_msats / 1000))
                    .with_amount(amount_msats, Some(invoice.encoded_invoice.clone())),
            )
            .await;

        match handle.join().await {
            MonitorOutcome::Paid => {
                if self.enter(JobStatus::Paid, JobStatus::Processing) {
                    self.process().await;
                }
            }
            MonitorOutcome::Expired => self.report_ended(JobStatus::Expired).await,
            MonitorOutcome::Failed => self.report_ended(JobStatus::Failed).await,
            MonitorOutcome::Cancelled => {}
        }
    }

    /// `Ok(None)` when cancelled.
    async fn create_invoice(
        &self,
        payments: &dyn PaymentProvider,
        amount_msats: u64,
        token: &CancellationToken,
    ) -> std::result::Result<Option<Invoice>, PaymentError> {
        let config = &self.core.config;
        let memo = format!(
            "{} job {} (kind {})",
            config.name,
            self.request.short_id(),
            self.request.job_kind
        );
        let mut backoff = config.invoice_retry.backoff(0);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let _ = self.core.registry.update(self.job_id(), |state| {
                state.attempts.invoice = attempt;
            });

            let created = tokio::select! {
                _ = token.cancelled() => return Ok(None),
                created = payments.create_invoice(amount_msats, &memo) => created,
            };
            match created {
                Ok(issued) => return Ok(Some(Invoice::from_issued(issued, amount_msats))),
                Err(e) if attempt >= config.max_invoice_attempts => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay().unwrap_or_default();
                    tracing::warn!(
                        job_id = %self.request.short_id(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "invoice creation failed: {e}"
                    );
                    if !sleep_or_cancel(token, delay).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Run inference and publish the outcome. The job is `Processing`.
    async fn process(&self) {
        let token = self.run.jobs.child_token();
        let started = std::time::Instant::now();
        let outcome = self.run.executor.execute(&self.request, &token).await;

        let output = match outcome {
            Ok(output) => output,
            Err(InferenceError::Cancelled) => {
                self.abandon("inference cancelled by shutdown");
                return;
            }
            Err(e) => {
                self.fail(JobStatus::Processing, JobError::new(ErrorKind::Inference, e.to_string()))
                    .await;
                return;
            }
        };

        tracing::debug!(
            job_id = %self.request.short_id(),
            model = %output.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inference finished"
        );

        match self
            .run
            .publisher
            .publish_result(self.job_id(), &output.content)
            .await
        {
            Ok(()) => {
                if self.enter(JobStatus::Processing, JobStatus::Completed) {
                    tracing::info!(job_id = %self.request.short_id(), "job completed");
                    self.core.telemetry.record(
                        categories::JOB,
                        "job_completed",
                        Some(&self.request.job_kind.to_string()),
                        Some(started.elapsed().as_millis() as f64),
                    );
                    let _ = self
                        .run
                        .publisher
                        .publish_feedback(self.job_id(), Feedback::new(FeedbackStatus::Success))
                        .await;
                }
            }
            Err(e) if self.run.publisher.is_closed() => {
                tracing::debug!(job_id = %self.request.short_id(), "result dropped at shutdown: {e}");
                self.abandon("result not published before shutdown");
            }
            Err(e) => {
                self.fail(JobStatus::Processing, JobError::new(ErrorKind::Publish, e.to_string()))
                    .await;
                return;
            }
        }
        self.schedule_eviction();
    }

    /// Move to `Failed` and tell the requester why.
    async fn fail(&self, from: JobStatus, error: JobError) {
        let recorded = error.clone();
        if let Err(e) = self.core.registry.transition(
            self.job_id(),
            from,
            JobStatus::Failed,
            move |state| state.last_error = Some(recorded),
        ) {
            tracing::debug!(job_id = %self.request.short_id(), "failure not recorded: {e}");
            return;
        }
        self.notify_failure(JobStatus::Failed, &error).await;
    }

    /// Report a terminal status the invoice monitor already committed.
    async fn report_ended(&self, status: JobStatus) {
        let error = self
            .core
            .registry
            .get(self.job_id())
            .and_then(|state| state.last_error)
            .unwrap_or_else(|| JobError::new(ErrorKind::Internal, status.as_str()));
        self.notify_failure(status, &error).await;
    }

    async fn notify_failure(&self, status: JobStatus, error: &JobError) {
        tracing::warn!(
            job_id = %self.request.short_id(),
            %status,
            kind = %error.kind,
            "job failed: {}",
            error.message
        );
        self.core.telemetry.record(
            categories::JOB,
            "job_failed",
            Some(error.kind.as_str()),
            None,
        );
        let _ = self.core.events.send(EngineEvent::JobFailed {
            job_id: self.job_id().to_string(),
            status,
            kind: error.kind,
            reason: error.message.clone(),
            timestamp: Utc::now(),
        });

        let _ = self
            .run
            .publisher
            .publish_feedback(
                self.job_id(),
                Feedback::new(FeedbackStatus::Error)
                    .with_info(error.kind.as_str())
                    .with_content(error.message.clone()),
            )
            .await;
        self.schedule_eviction();
    }

    /// Fail a processing job at shutdown without publishing anything.
    fn abandon(&self, reason: &str) {
        let _ = self.core.registry.transition(
            self.job_id(),
            JobStatus::Processing,
            JobStatus::Failed,
            |state| state.last_error = Some(JobError::new(ErrorKind::Internal, reason)),
        );
    }

    fn schedule_eviction(&self) {
        let registry = self.core.registry.clone();
        let job_id = self.job_id().to_string();
        let grace = self.core.config.eviction_grace();
        let shutdown = self.run.shutdown.clone();
        self.core.tracker.spawn(async move {
            if sleep_or_cancel(&shutdown, grace).await {
                registry.evict(&job_id);
            }
        });
    }
}
