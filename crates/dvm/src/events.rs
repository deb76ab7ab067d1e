//! Engine events
//!
//! Every state change the engine makes is broadcast as an [`EngineEvent`] so
//! an operator surface can follow along without polling the registry.

use crate::error::ErrorKind;
use crate::job::{JobStatus, short_id};
use crate::nip90::FeedbackStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Engine started listening for job requests
    WentOnline {
        relays: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Engine stopped
    WentOffline { timestamp: DateTime<Utc> },
    /// The listener lost its subscription and is backing off
    ListenerReconnecting {
        attempt: u32,
        delay_ms: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A request was admitted and a job created
    JobReceived {
        job_id: String,
        kind: u16,
        requester: String,
        timestamp: DateTime<Utc>,
    },
    /// A job moved between statuses
    JobTransitioned {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
        timestamp: DateTime<Utc>,
    },
    /// A job ended in a non-success terminal status
    JobFailed {
        job_id: String,
        status: JobStatus,
        kind: ErrorKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was removed from the registry
    JobEvicted {
        job_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An invoice was issued for a job
    InvoiceCreated {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },
    /// The invoice for a job was paid
    PaymentReceived {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },

    /// A result message went out
    ResultPublished {
        job_id: String,
        event_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A feedback message went out
    FeedbackPublished {
        job_id: String,
        status: FeedbackStatus,
        event_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::WentOnline { timestamp, .. } => *timestamp,
            EngineEvent::WentOffline { timestamp } => *timestamp,
            EngineEvent::ListenerReconnecting { timestamp, .. } => *timestamp,
            EngineEvent::JobReceived { timestamp, .. } => *timestamp,
            EngineEvent::JobTransitioned { timestamp, .. } => *timestamp,
            EngineEvent::JobFailed { timestamp, .. } => *timestamp,
            EngineEvent::JobEvicted { timestamp, .. } => *timestamp,
            EngineEvent::InvoiceCreated { timestamp, .. } => *timestamp,
            EngineEvent::PaymentReceived { timestamp, .. } => *timestamp,
            EngineEvent::ResultPublished { timestamp, .. } => *timestamp,
            EngineEvent::FeedbackPublished { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            EngineEvent::JobReceived { job_id, .. }
            | EngineEvent::JobTransitioned { job_id, .. }
            | EngineEvent::JobFailed { job_id, .. }
            | EngineEvent::JobEvicted { job_id, .. }
            | EngineEvent::InvoiceCreated { job_id, .. }
            | EngineEvent::PaymentReceived { job_id, .. }
            | EngineEvent::ResultPublished { job_id, .. }
            | EngineEvent::FeedbackPublished { job_id, .. } => Some(job_id),
            EngineEvent::WentOnline { .. }
            | EngineEvent::WentOffline { .. }
            | EngineEvent::ListenerReconnecting { .. } => None,
        }
    }

    /// Get a short description of the event for logging
    pub fn description(&self) -> String {
        match self {
            EngineEvent::WentOnline { relays, .. } => {
                format!("Went online ({} relays)", relays.len())
            }
            EngineEvent::WentOffline { .. } => "Went offline".to_string(),
            EngineEvent::ListenerReconnecting {
                attempt, delay_ms, ..
            } => format!("Resubscribing in {delay_ms}ms (attempt {attempt})"),
            EngineEvent::JobReceived { job_id, kind, .. } => {
                format!("Job received: {} (kind {})", short_id(job_id), kind)
            }
            EngineEvent::JobTransitioned {
                job_id, from, to, ..
            } => format!("Job {}: {} -> {}", short_id(job_id), from, to),
            EngineEvent::JobFailed {
                job_id,
                status,
                kind,
                ..
            } => format!("Job {} {} ({})", short_id(job_id), status, kind),
            EngineEvent::JobEvicted { job_id, .. } => {
                format!("Job evicted: {}", short_id(job_id))
            }
            EngineEvent::InvoiceCreated { amount_msats, .. } => {
                format!("Invoice created: {} sats", amount_msats / 1000)
            }
            EngineEvent::PaymentReceived { amount_msats, .. } => {
                format!("Payment received: {} sats", amount_msats / 1000)
            }
            EngineEvent::ResultPublished { job_id, .. } => {
                format!("Result published: {}", short_id(job_id))
            }
            EngineEvent::FeedbackPublished { job_id, status, .. } => {
                format!("Feedback published: {} ({})", short_id(job_id), status.as_str())
            }
        }
    }
}
