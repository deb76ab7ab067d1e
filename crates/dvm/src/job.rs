//! Job types for NIP-90 DVM job processing

use crate::error::JobError;
use crate::event::Event;
use crate::nip90::{InputType, JobInput, JobParam};
use crate::payment::Invoice;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An admitted NIP-90 job request. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Event id of the request; doubles as the job id
    pub id: String,
    pub requester_key: String,
    /// The job kind (5000-5999)
    pub job_kind: u16,
    /// Inputs in tag order
    pub inputs: Vec<JobInput>,
    pub params: Vec<JobParam>,
    /// Requested output MIME type
    pub output: Option<String>,
    /// Bid from the `bid` tag, in millisats
    pub offered_price_msats: Option<u64>,
    /// Relays the requester wants responses on
    pub relay_hints: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// The signed request, echoed back in the result's `request` tag
    pub event: Event,
}

impl JobRequest {
    /// First param with the given key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Text inputs joined in order.
    pub fn text_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|i| i.input_type == InputType::Text)
            .map(|i| i.data.as_str())
    }

    /// Get a short display ID
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Lifecycle status of a job.
///
/// ```text
/// Received        -> AwaitingPayment | Processing | Failed
/// AwaitingPayment -> Paid | Expired | Cancelled | Failed
/// Paid            -> Processing
/// Processing      -> Completed | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Received,
    AwaitingPayment,
    Paid,
    Processing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Received, AwaitingPayment)
                | (Received, Processing)
                | (Received, Failed)
                | (AwaitingPayment, Paid)
                | (AwaitingPayment, Expired)
                | (AwaitingPayment, Cancelled)
                | (AwaitingPayment, Failed)
                | (Paid, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::AwaitingPayment => "awaiting-payment",
            JobStatus::Paid => "paid",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry counters per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAttempts {
    pub invoice: u32,
    pub payment_poll_failures: u32,
    pub publish: u32,
}

/// The registry's record of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub request: Arc<JobRequest>,
    pub status: JobStatus,
    /// Present once the job has entered `AwaitingPayment`
    pub invoice: Option<Invoice>,
    pub attempts: PhaseAttempts,
    pub last_error: Option<JobError>,
    pub result_published: bool,
    #[serde(skip)]
    pub(crate) result_publish_in_flight: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(request: Arc<JobRequest>) -> Self {
        let now = Utc::now();
        Self {
            job_id: request.id.clone(),
            request,
            status: JobStatus::Received,
            invoice: None,
            attempts: PhaseAttempts::default(),
            last_error: None,
            result_published: false,
            result_publish_in_flight: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.job_id)
    }
}
