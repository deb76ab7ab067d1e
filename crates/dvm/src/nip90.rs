//! NIP-90: Data Vending Machine wire format
//!
//! ## Kinds
//! - 5000-5999: Job request kinds
//! - 6000-6999: Job result kinds (request kind + 1000)
//! - 7000: Job feedback
//!
//! This module converts between signed [`Event`]s and the engine's
//! [`JobRequest`], and builds the result and feedback templates the engine
//! publishes.

use crate::event::{Event, EventTemplate};
use crate::job::JobRequest;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const JOB_REQUEST_KIND_MIN: u16 = 5000;
pub const JOB_REQUEST_KIND_MAX: u16 = 5999;

pub const JOB_RESULT_KIND_MIN: u16 = 6000;
pub const JOB_RESULT_KIND_MAX: u16 = 6999;

pub const KIND_JOB_FEEDBACK: u16 = 7000;

pub const KIND_JOB_TEXT_EXTRACTION: u16 = 5000;
pub const KIND_JOB_SUMMARIZATION: u16 = 5001;
pub const KIND_JOB_TRANSLATION: u16 = 5002;
pub const KIND_JOB_TEXT_GENERATION: u16 = 5050;

/// Reasons an inbound event cannot be turned into a job request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("kind {0} is outside the job request range")]
    NotAJobRequest(u16),

    #[error("missing required tag: {0}")]
    MissingTag(String),

    #[error("malformed tag: {0}")]
    MalformedTag(String),

    #[error("invalid input type: {0}")]
    InvalidInputType(String),

    #[error("invalid bid: {0}")]
    InvalidBid(String),

    #[error("invalid signature")]
    InvalidSignature,
}

/// Input type for the `i` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Url,
    Event,
    Job,
    Text,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Url => "url",
            InputType::Event => "event",
            InputType::Job => "job",
            InputType::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.to_lowercase().as_str() {
            "url" => Ok(InputType::Url),
            "event" => Ok(InputType::Event),
            "job" => Ok(InputType::Job),
            "text" => Ok(InputType::Text),
            _ => Err(ValidationError::InvalidInputType(s.to_string())),
        }
    }
}

/// Status carried in the `status` tag of a feedback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackStatus {
    PaymentRequired,
    Processing,
    Error,
    Success,
    Partial,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::PaymentRequired => "payment-required",
            FeedbackStatus::Processing => "processing",
            FeedbackStatus::Error => "error",
            FeedbackStatus::Success => "success",
            FeedbackStatus::Partial => "partial",
        }
    }
}

/// One `i` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub data: String,
    pub input_type: InputType,
    pub relay: Option<String>,
    pub marker: Option<String>,
}

impl JobInput {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            input_type: InputType::Text,
            relay: None,
            marker: None,
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn to_tag(&self) -> Vec<String> {
        let mut tag = vec![
            "i".to_string(),
            self.data.clone(),
            self.input_type.as_str().to_string(),
        ];
        if self.relay.is_some() || self.marker.is_some() {
            tag.push(self.relay.clone().unwrap_or_default());
        }
        if let Some(marker) = &self.marker {
            tag.push(marker.clone());
        }
        tag
    }

    pub fn from_tag(tag: &[String]) -> Result<Self, ValidationError> {
        if tag.len() < 3 || tag[0] != "i" {
            return Err(ValidationError::MalformedTag(
                "i tag requires at least 3 elements".to_string(),
            ));
        }
        Ok(Self {
            data: tag[1].clone(),
            input_type: InputType::parse(&tag[2])?,
            relay: tag.get(3).filter(|s| !s.is_empty()).cloned(),
            marker: tag.get(4).filter(|s| !s.is_empty()).cloned(),
        })
    }
}

/// One `param` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParam {
    pub key: String,
    pub value: String,
}

impl JobParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn from_tag(tag: &[String]) -> Result<Self, ValidationError> {
        if tag.len() < 3 || tag[0] != "param" {
            return Err(ValidationError::MalformedTag(
                "param tag requires 3 elements".to_string(),
            ));
        }
        Ok(Self::new(tag[1].clone(), tag[2].clone()))
    }
}

pub fn is_job_request_kind(kind: u16) -> bool {
    (JOB_REQUEST_KIND_MIN..=JOB_REQUEST_KIND_MAX).contains(&kind)
}

pub fn is_job_result_kind(kind: u16) -> bool {
    (JOB_RESULT_KIND_MIN..=JOB_RESULT_KIND_MAX).contains(&kind)
}

pub fn result_kind_for(request_kind: u16) -> u16 {
    request_kind + 1000
}

/// Whether a request is addressed to `pubkey`.
///
/// Requests without `p` tags are open to every provider.
pub fn is_addressed_to(event: &Event, pubkey: &str) -> bool {
    let mut targeted = event.tags_named("p").peekable();
    if targeted.peek().is_none() {
        return true;
    }
    targeted.any(|tag| tag.get(1).map(String::as_str) == Some(pubkey))
}

/// Parse the structure of a job request event. Signature checks are the
/// caller's concern.
pub fn parse_job_request(event: &Event) -> Result<JobRequest, ValidationError> {
    if !is_job_request_kind(event.kind) {
        return Err(ValidationError::NotAJobRequest(event.kind));
    }

    let mut inputs = Vec::new();
    let mut params = Vec::new();
    let mut output = None;
    let mut bid = None;
    let mut relay_hints = Vec::new();

    for tag in &event.tags {
        match tag.first().map(String::as_str) {
            Some("i") => inputs.push(JobInput::from_tag(tag)?),
            Some("param") => params.push(JobParam::from_tag(tag)?),
            Some("output") => output = tag.get(1).cloned(),
            Some("bid") => {
                let raw = tag
                    .get(1)
                    .ok_or_else(|| ValidationError::MalformedTag("bid".to_string()))?;
                bid = Some(
                    raw.parse::<u64>()
                        .map_err(|_| ValidationError::InvalidBid(raw.clone()))?,
                );
            }
            Some("relays") => relay_hints.extend(tag.iter().skip(1).cloned()),
            _ => {}
        }
    }

    if inputs.is_empty() {
        return Err(ValidationError::MissingTag("i".to_string()));
    }

    Ok(JobRequest {
        id: event.id.clone(),
        requester_key: event.pubkey.clone(),
        job_kind: event.kind,
        inputs,
        params,
        output,
        offered_price_msats: bid,
        relay_hints,
        received_at: Utc::now(),
        event: event.clone(),
    })
}

/// `e` and `p` tags pointing back at the request.
fn reference_tags(request: &JobRequest) -> Vec<Vec<String>> {
    let mut e_tag = vec!["e".to_string(), request.id.clone()];
    if let Some(relay) = request.relay_hints.first() {
        e_tag.push(relay.clone());
    }
    vec![e_tag, vec!["p".to_string(), request.requester_key.clone()]]
}

/// Build the kind 6xxx result event for a completed job.
pub fn result_template(
    request: &JobRequest,
    content: &str,
    amount: Option<(u64, Option<&str>)>,
) -> EventTemplate {
    let mut tags = reference_tags(request);
    tags.push(vec![
        "request".to_string(),
        serde_json::to_string(&request.event).unwrap_or_default(),
    ]);
    for input in &request.inputs {
        tags.push(input.to_tag());
    }
    if let Some((msats, invoice)) = amount {
        tags.push(amount_tag(msats, invoice));
    }
    EventTemplate::new(result_kind_for(request.job_kind), tags, content)
}

/// Build a kind 7000 feedback event.
pub fn feedback_template(
    request: &JobRequest,
    status: FeedbackStatus,
    extra_info: Option<&str>,
    content: &str,
    amount: Option<(u64, Option<&str>)>,
) -> EventTemplate {
    let mut status_tag = vec!["status".to_string(), status.as_str().to_string()];
    if let Some(info) = extra_info {
        status_tag.push(info.to_string());
    }
    let mut tags = vec![status_tag];
    tags.extend(reference_tags(request));
    if let Some((msats, invoice)) = amount {
        tags.push(amount_tag(msats, invoice));
    }
    EventTemplate::new(KIND_JOB_FEEDBACK, tags, content)
}

fn amount_tag(msats: u64, invoice: Option<&str>) -> Vec<String> {
    let mut tag = vec!["amount".to_string(), msats.to_string()];
    if let Some(invoice) = invoice {
        tag.push(invoice.to_string());
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Keys;

    fn request_event(kind: u16, tags: Vec<Vec<String>>) -> Event {
        Keys::generate()
            .sign(&EventTemplate::new(kind, tags, ""))
            .unwrap()
    }

    fn tag(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_full_request() {
        let event = request_event(
            5050,
            vec![
                tag(&["i", "Write a haiku", "text"]),
                tag(&["i", "abc123", "event", "wss://relay.example", "context"]),
                tag(&["param", "model", "llama3.2"]),
                tag(&["output", "text/plain"]),
                tag(&["bid", "5000"]),
                tag(&["relays", "wss://a.example", "wss://b.example"]),
            ],
        );

        let request = parse_job_request(&event).unwrap();
        assert_eq!(request.id, event.id);
        assert_eq!(request.job_kind, 5050);
        assert_eq!(request.inputs.len(), 2);
        assert_eq!(request.inputs[1].relay.as_deref(), Some("wss://relay.example"));
        assert_eq!(request.inputs[1].marker.as_deref(), Some("context"));
        assert_eq!(request.param("model"), Some("llama3.2"));
        assert_eq!(request.output.as_deref(), Some("text/plain"));
        assert_eq!(request.offered_price_msats, Some(5000));
        assert_eq!(request.relay_hints, vec!["wss://a.example", "wss://b.example"]);
    }

    #[test]
    fn test_missing_input_is_rejected() {
        let event = request_event(5050, vec![tag(&["param", "model", "x"])]);
        assert_eq!(
            parse_job_request(&event).unwrap_err(),
            ValidationError::MissingTag("i".to_string())
        );
    }

    #[test]
    fn test_bad_input_type_and_bid_are_rejected() {
        let event = request_event(5050, vec![tag(&["i", "x", "carrier-pigeon"])]);
        assert!(matches!(
            parse_job_request(&event),
            Err(ValidationError::InvalidInputType(_))
        ));

        let event = request_event(5050, vec![tag(&["i", "x", "text"]), tag(&["bid", "lots"])]);
        assert!(matches!(
            parse_job_request(&event),
            Err(ValidationError::InvalidBid(_))
        ));
    }

    #[test]
    fn test_non_request_kind_is_rejected() {
        let event = request_event(1, vec![tag(&["i", "x", "text"])]);
        assert_eq!(
            parse_job_request(&event).unwrap_err(),
            ValidationError::NotAJobRequest(1)
        );
    }

    #[test]
    fn test_addressing() {
        let open = request_event(5050, vec![tag(&["i", "x", "text"])]);
        assert!(is_addressed_to(&open, "me"));

        let targeted = request_event(5050, vec![tag(&["i", "x", "text"]), tag(&["p", "other"])]);
        assert!(!is_addressed_to(&targeted, "me"));
        assert!(is_addressed_to(&targeted, "other"));
    }

    #[test]
    fn test_result_and_feedback_templates() {
        let event = request_event(
            5050,
            vec![tag(&["i", "hi", "text"]), tag(&["relays", "wss://r.example"])],
        );
        let request = parse_job_request(&event).unwrap();

        let result = result_template(&request, "Hello", Some((1000, Some("lnbc1..."))));
        assert_eq!(result.kind, 6050);
        assert_eq!(result.content, "Hello");
        assert!(result
            .tags
            .contains(&tag(&["e", request.id.as_str(), "wss://r.example"])));
        assert!(result.tags.contains(&tag(&["amount", "1000", "lnbc1..."])));
        assert!(result.tags.iter().any(|t| t[0] == "request"));

        let feedback = feedback_template(
            &request,
            FeedbackStatus::Error,
            Some("inference"),
            "provider unavailable",
            None,
        );
        assert_eq!(feedback.kind, KIND_JOB_FEEDBACK);
        assert_eq!(feedback.tags[0], tag(&["status", "error", "inference"]));
        assert!(feedback.tags.contains(&tag(&["p", request.requester_key.as_str()])));
    }

    #[test]
    fn test_kind_ranges() {
        assert!(is_job_request_kind(5100));
        assert!(!is_job_request_kind(9999));
        assert!(is_job_result_kind(result_kind_for(5100)));
    }
}
