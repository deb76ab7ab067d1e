//! NIP-90 Data Vending Machine engine
//!
//! Listens for NIP-90 job requests on Nostr relays, optionally gates them
//! behind a Lightning invoice, runs them against a pluggable inference
//! provider and publishes the result and status feedback back to the relays.
//!
//! # Architecture
//!
//! ```text
//! JobListener -> DvmEngine -> [InvoiceMonitor] -> InferenceExecutor -> ResultPublisher
//!                    \______________ JobRegistry ______________/
//! ```
//!
//! The transport, payment and inference backends are collaborators behind
//! the [`Transport`], [`PaymentProvider`] and [`InferenceProvider`] traits.

pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod executor;
pub mod job;
pub mod listener;
pub mod monitor;
pub mod nip90;
pub mod orchestrator;
pub mod payment;
pub mod provider;
pub mod publisher;
pub mod registry;
pub mod task;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;

pub use backoff::{ExponentialBackoff, Jitter, RetryPolicy};
pub use config::{DvmConfig, KindPrice, SecretString};
pub use error::{AdmissionError, DvmError, ErrorKind, JobError};
pub use event::{Event, EventTemplate, Keys, finalize_event, verify_event};
pub use events::EngineEvent;
pub use executor::{ExecutionMode, InferenceError, InferenceExecutor, InferenceOutput, JobFamily};
pub use job::{JobRequest, JobState, JobStatus, PhaseAttempts};
pub use listener::JobListener;
pub use monitor::{InvoiceMonitor, MonitorHandle, MonitorOutcome};
pub use nip90::{FeedbackStatus, InputType, JobInput, JobParam, ValidationError};
pub use orchestrator::DvmEngine;
pub use payment::{Invoice, InvoiceStatus, IssuedInvoice, PaymentError, PaymentProvider};
pub use provider::{
    GenerationOptions, InferenceProvider, LocalBridgeProvider, Prompt, ProviderError,
    RemoteApiProvider, Response, TextChunk, TextStream, Usage,
};
pub use publisher::{Feedback, PublishError, ResultPublisher};
pub use registry::{JobRegistry, PublishClaim, RegistryError};
pub use telemetry::{NoopTelemetry, Telemetry, TracingTelemetry, init_logging};
pub use transport::{EventStream, Filter, Transport, TransportError};
