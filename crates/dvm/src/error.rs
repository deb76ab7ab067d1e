//! Error taxonomy shared across the engine

use crate::executor::InferenceError;
use crate::nip90::ValidationError;
use crate::payment::PaymentError;
use crate::publisher::PublishError;
use crate::registry::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Short machine-readable class of a job failure.
///
/// The string form is placed in the `status` tag of error feedback so
/// requesters can tell why a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    AdmissionDenied,
    Payment,
    PaymentTimeout,
    PaymentCheck,
    Inference,
    Publish,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::AdmissionDenied => "admission-denied",
            ErrorKind::Payment => "payment",
            ErrorKind::PaymentTimeout => "payment-timeout",
            ErrorKind::PaymentCheck => "payment-check",
            ErrorKind::Inference => "inference",
            ErrorKind::Publish => "publish",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of the error that ended (or is retrying) a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why the listener refused to admit a message.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("duplicate message {0}")]
    Duplicate(String),

    #[error("not addressed to this node")]
    NotAddressed,

    #[error("invalid job request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("job kind {0} is not served by this node")]
    Denied(u16),
}

impl AdmissionError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AdmissionError::Invalid(_) => Some(ErrorKind::Validation),
            AdmissionError::Denied(_) => Some(ErrorKind::AdmissionDenied),
            AdmissionError::Duplicate(_) | AdmissionError::NotAddressed => None,
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum DvmError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not running")]
    NotRunning,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("invoice monitor already running for job {0}")]
    MonitorAlreadyRunning(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DvmError>;
