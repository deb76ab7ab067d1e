//! DVM configuration

use crate::backoff::RetryPolicy;
use crate::error::DvmError;
use crate::event::Keys;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A string that never shows up in logs.
///
/// Serialized as-is so the config file round-trips.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Price for one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPrice {
    pub kind: u16,
    pub msats: u64,
}

/// DVM configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DvmConfig {
    /// Provider name, used in invoice memos
    pub name: String,
    /// Nostr relays to listen and publish on
    pub relays: Vec<String>,
    /// Job request kinds this node serves
    pub supported_kinds: Vec<u16>,
    /// Kinds refused even if listed as supported
    #[serde(default)]
    pub blacklisted_kinds: Vec<u16>,
    /// Price for supported kinds without an entry in `prices`
    #[serde(default)]
    pub default_price_msats: u64,
    /// Requester pubkeys that never pay
    #[serde(default)]
    pub exempt_requesters: Vec<String>,
    /// Hex secret key used to sign results and feedback
    #[serde(default)]
    pub signing_key: Option<SecretString>,
    /// Model used when a request does not name one
    pub default_model: String,

    pub poll_interval_ms: u64,
    pub payment_timeout_ms: u64,
    pub max_poll_failures: u32,
    pub max_publish_attempts: u32,
    pub max_invoice_attempts: u32,
    /// Maximum duration of one inference call
    pub inference_timeout_ms: u64,
    /// Publish a `processing` feedback every N streamed chunks (0 disables)
    pub stream_feedback_every: usize,
    /// How long terminal jobs stay in the registry
    pub eviction_grace_ms: u64,
    /// How long `stop()` waits for in-flight inference
    pub shutdown_grace_ms: u64,
    /// Number of recent request ids remembered for deduplication
    pub dedup_window: usize,

    /// Per-kind prices in millisats
    #[serde(default, rename = "price")]
    pub prices: Vec<KindPrice>,

    #[serde(default = "default_publish_retry")]
    pub publish_retry: RetryPolicy,
    #[serde(default = "default_poll_retry")]
    pub poll_retry: RetryPolicy,
    #[serde(default = "default_invoice_retry")]
    pub invoice_retry: RetryPolicy,
    #[serde(default = "default_reconnect_retry")]
    pub reconnect_retry: RetryPolicy,
}

fn default_publish_retry() -> RetryPolicy {
    RetryPolicy::new(250, 5_000)
}

fn default_poll_retry() -> RetryPolicy {
    RetryPolicy::new(500, 10_000)
}

fn default_invoice_retry() -> RetryPolicy {
    RetryPolicy::new(500, 5_000)
}

fn default_reconnect_retry() -> RetryPolicy {
    RetryPolicy::new(1_000, 60_000)
}

impl Default for DvmConfig {
    fn default() -> Self {
        Self {
            name: "DVM".to_string(),
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.nostr.band".to_string(),
            ],
            supported_kinds: vec![5000, 5001, 5002, 5050],
            blacklisted_kinds: Vec::new(),
            prices: Vec::new(),
            default_price_msats: 0,
            exempt_requesters: Vec::new(),
            signing_key: None,
            default_model: "llama3.2".to_string(),
            poll_interval_ms: 2_000,
            payment_timeout_ms: 600_000,
            max_poll_failures: 5,
            max_publish_attempts: 4,
            max_invoice_attempts: 3,
            inference_timeout_ms: 120_000,
            stream_feedback_every: 16,
            eviction_grace_ms: 300_000,
            shutdown_grace_ms: 10_000,
            dedup_window: 4_096,
            publish_retry: default_publish_retry(),
            poll_retry: default_poll_retry(),
            invoice_retry: default_invoice_retry(),
            reconnect_retry: default_reconnect_retry(),
        }
    }
}

impl DvmConfig {
    /// Load config from the default path, or defaults if no file exists
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DvmConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("dvm").join("config.toml"))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), DvmError> {
        let problem = if self.relays.is_empty() {
            Some("no relays configured")
        } else if self.supported_kinds.is_empty() {
            Some("no supported job kinds")
        } else if self.poll_interval_ms == 0 {
            Some("poll_interval_ms must be positive")
        } else if self.payment_timeout_ms == 0 {
            Some("payment_timeout_ms must be positive")
        } else if self.inference_timeout_ms == 0 {
            Some("inference_timeout_ms must be positive")
        } else if self.max_publish_attempts == 0 {
            Some("max_publish_attempts must be at least 1")
        } else if self.max_invoice_attempts == 0 {
            Some("max_invoice_attempts must be at least 1")
        } else if self.dedup_window == 0 {
            Some("dedup_window must be positive")
        } else {
            None
        };
        if let Some(problem) = problem {
            return Err(DvmError::Config(problem.to_string()));
        }

        if let Some(key) = &self.signing_key {
            Keys::from_hex(key.expose_secret())
                .map_err(|e| DvmError::Config(format!("signing_key: {e}")))?;
        }
        Ok(())
    }

    /// Whether requests of this kind are admitted.
    pub fn accepts_kind(&self, kind: u16) -> bool {
        self.supported_kinds.contains(&kind) && !self.blacklisted_kinds.contains(&kind)
    }

    /// Price in millisats for `kind`.
    pub fn price_for(&self, kind: u16) -> u64 {
        self.prices
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.msats)
            .unwrap_or(self.default_price_msats)
    }

    /// Amount the requester must pay before the job runs, if any.
    pub fn required_payment(&self, kind: u16, requester: &str) -> Option<u64> {
        if self.exempt_requesters.iter().any(|r| r == requester) {
            return None;
        }
        Some(self.price_for(kind)).filter(|&msats| msats > 0)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_supported_kinds(mut self, kinds: Vec<u16>) -> Self {
        self.supported_kinds = kinds;
        self
    }

    pub fn with_price(mut self, kind: u16, msats: u64) -> Self {
        self.prices.retain(|p| p.kind != kind);
        self.prices.push(KindPrice { kind, msats });
        self
    }

    pub fn with_signing_key(mut self, hex_key: impl Into<String>) -> Self {
        self.signing_key = Some(SecretString::new(hex_key));
        self
    }
}
