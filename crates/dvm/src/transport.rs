//! Messaging collaborator contract
//!
//! Relay connections, pooling and socket-level reconnection belong to the
//! transport. The engine only subscribes with a [`Filter`] and publishes
//! signed events; when a subscription stream ends or errors the listener
//! resubscribes on its own schedule.

use crate::event::Event;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection dropped, relay unreachable, timed out
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Relay answered `OK false` for a reason retrying will not fix
    #[error("Event rejected: {0}")]
    Rejected(String),

    #[error("Not connected to any relay")]
    NotConnected,
}

impl TransportError {
    /// Whether the same publish may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// NIP-01 subscription filter (the subset the engine uses).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether `event` passes this filter. Empty fields match everything.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if !self.p.is_empty() {
            return event
                .tags_named("p")
                .any(|tag| tag.get(1).is_some_and(|pk| self.p.contains(pk)));
        }
        true
    }
}

pub type EventStream = BoxStream<'static, Result<Event, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a subscription. The stream ends or yields an error when the
    /// subscription is lost.
    async fn subscribe(&self, relays: &[String], filter: Filter)
    -> Result<EventStream, TransportError>;

    /// Publish a signed event. `Ok` means at least one relay accepted it.
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<(), TransportError>;
}
