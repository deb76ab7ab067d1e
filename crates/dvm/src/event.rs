//! Signed Nostr events (NIP-01).
//!
//! The engine only needs a small slice of NIP-01: the event structure, the
//! canonical serialization used for the event id, Schnorr signing of outbound
//! messages and verification of inbound job requests.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from event construction and verification.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex sha256 of the serialized event
    pub id: String,
    /// Lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Lowercase hex Schnorr signature over `id`
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// All tags named `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
    }
}

/// An event before the author key and signature are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// The node's signing identity.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    pub fn new(secret_key: [u8; 32]) -> Result<Self, EventError> {
        let public_key = public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Parse a 64-character hex secret key.
    pub fn from_hex(value: &str) -> Result<Self, EventError> {
        let bytes =
            hex::decode(value.trim()).map_err(|e| EventError::InvalidSecretKey(e.to_string()))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EventError::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::new(secret_key)
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        loop {
            let mut secret_key = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret_key);
            if let Ok(keys) = Self::new(secret_key) {
                return keys;
            }
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn sign(&self, template: &EventTemplate) -> Result<Event, EventError> {
        finalize_event(template, &self.secret_key)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

pub fn public_key_hex(secret_key: &[u8; 32]) -> Result<String, EventError> {
    let secp = Secp256k1::signing_only();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| EventError::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

/// Canonical `[0, pubkey, created_at, kind, tags, content]` serialization.
fn serialize_for_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, EventError> {
    serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
        .map_err(|e| EventError::Serialization(e.to_string()))
}

fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let serialized = serialize_for_id(pubkey, created_at, kind, tags, content)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

/// Compute the id for a template and sign it.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, EventError> {
    let secp = Secp256k1::new();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| EventError::InvalidSecretKey(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();
    let pubkey = hex::encode(xonly.serialize());

    let digest = event_hash(
        &pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    )?;
    let message =
        Message::from_digest_slice(&digest).map_err(|e| EventError::Signing(e.to_string()))?;
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}

/// Check the id matches the content and the signature matches the id.
///
/// Structural problems (bad hex, wrong lengths) are reported as errors; a
/// well-formed event with a wrong id or signature returns `Ok(false)`.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    let digest = event_hash(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )?;
    if hex::encode(digest) != event.id {
        return Ok(false);
    }

    let message =
        Message::from_digest_slice(&digest).map_err(|e| EventError::Verification(e.to_string()))?;
    let sig_bytes =
        hex::decode(&event.sig).map_err(|e| EventError::Verification(format!("sig hex: {e}")))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::Verification(format!("signature: {e}")))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::Verification(format!("pubkey hex: {e}")))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::Verification(format!("pubkey: {e}")))?;

    let secp = Secp256k1::verification_only();
    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
