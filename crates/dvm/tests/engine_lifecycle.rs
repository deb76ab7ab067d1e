//! Drives a DVM engine through its public API with in-memory relay, wallet
//! and model backends.

use async_trait::async_trait;
use chrono::Utc;
use dvm::{
    DvmConfig, DvmEngine, EngineEvent, Event, EventStream, EventTemplate, Filter,
    GenerationOptions, InferenceProvider, InvoiceStatus, IssuedInvoice, JobStatus, Jitter, Keys,
    NoopTelemetry, PaymentError, PaymentProvider, Prompt, ProviderError, Response, RetryPolicy,
    TextChunk, TextStream, Transport, TransportError, verify_event,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const NODE_SECRET: &str = "3f2a7c1d9e8b4a6f5c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f1a2b";

#[derive(Default)]
struct MemoryRelay {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<Event, TransportError>>>>,
    published: Mutex<Vec<Event>>,
}

impl MemoryRelay {
    fn send(&self, event: &Event) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    fn published_kind(&self, kind: u16) -> Vec<Event> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn subscribe(
        &self,
        _relays: &[String],
        filter: Filter,
    ) -> Result<EventStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        // Behave like a relay: only events matching the filter come through.
        Ok(Box::pin(futures::StreamExt::filter(stream, move |item| {
            let keep = match item {
                Ok(event) => filter.matches(event),
                Err(_) => true,
            };
            async move { keep }
        })))
    }

    async fn publish(&self, event: &Event, _relays: &[String]) -> Result<(), TransportError> {
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Wallet {
    paid: AtomicBool,
}

#[async_trait]
impl PaymentProvider for Wallet {
    async fn create_invoice(
        &self,
        amount_msats: u64,
        _memo: &str,
    ) -> Result<IssuedInvoice, PaymentError> {
        Ok(IssuedInvoice {
            encoded_invoice: format!("lnbc{}n1wallet", amount_msats / 100),
            payment_hash: "ab".repeat(32),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        })
    }

    async fn check_status(&self, _payment_hash: &str) -> Result<InvoiceStatus, PaymentError> {
        Ok(if self.paid.load(Ordering::SeqCst) {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Pending
        })
    }
}

/// Replies with the prompt in upper case.
struct Shouter;

#[async_trait]
impl InferenceProvider for Shouter {
    fn id(&self) -> &str {
        "shouter"
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn generate_text(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
        _cancel: &CancellationToken,
    ) -> Result<Response, ProviderError> {
        Ok(Response {
            text: prompt.user.to_uppercase(),
            model: options.model.clone(),
            finish_reason: Some("stop".into()),
            usage: None,
        })
    }

    async fn stream_text(
        &self,
        prompt: &Prompt,
        _options: &GenerationOptions,
        _cancel: &CancellationToken,
    ) -> Result<TextStream, ProviderError> {
        let chunk = TextChunk {
            delta: prompt.user.to_uppercase(),
            finish_reason: Some("stop".into()),
        };
        Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
    }

    async fn generate_structured(
        &self,
        _prompt: &Prompt,
        _schema: &serde_json::Value,
        options: &GenerationOptions,
        _cancel: &CancellationToken,
    ) -> Result<Response, ProviderError> {
        Ok(Response {
            text: r#"{"ok":true}"#.into(),
            model: options.model.clone(),
            finish_reason: Some("stop".into()),
            usage: None,
        })
    }
}

fn config() -> DvmConfig {
    let quick = RetryPolicy::new(5, 20).with_jitter(Jitter::None);
    let mut config = DvmConfig::default()
        .with_name("Lifecycle DVM")
        .with_relays(vec!["wss://relay.example".into()])
        .with_supported_kinds(vec![5050, 5001])
        .with_price(5001, 2_000)
        .with_signing_key(NODE_SECRET);
    config.poll_interval_ms = 10;
    config.publish_retry = quick;
    config.reconnect_retry = quick;
    config.shutdown_grace_ms = 500;
    config
}

fn request(keys: &Keys, kind: u16, text: &str) -> Event {
    let tags = vec![vec!["i".to_string(), text.to_string(), "text".to_string()]];
    keys.sign(&EventTemplate::new(kind, tags, "")).unwrap()
}

async fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_free_and_paid_jobs_through_public_api() {
    let relay = Arc::new(MemoryRelay::default());
    let wallet = Arc::new(Wallet::default());
    let engine = DvmEngine::new(
        config(),
        relay.clone(),
        Some(wallet.clone() as Arc<dyn PaymentProvider>),
        Arc::new(Shouter),
        Arc::new(NoopTelemetry),
    )
    .unwrap();
    let mut events = engine.events();

    engine.start().await.unwrap();
    let listening = relay.clone();
    eventually("subscription", || listening.subscriber_count() == 1).await;

    let alice = Keys::generate();

    // Free text generation
    let free = request(&alice, 5050, "hello dvm");
    relay.send(&free);
    let registry = engine.registry().clone();
    eventually("free job", || registry.status(&free.id) == Some(JobStatus::Completed)).await;

    let results = relay.published_kind(6050);
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.content, "HELLO DVM");
    assert_eq!(result.pubkey, engine.public_key());
    assert!(verify_event(result).unwrap());
    assert_eq!(result.tag_value("e"), Some(free.id.as_str()));
    assert_eq!(result.tag_value("p"), Some(alice.public_key()));
    let embedded: Event = serde_json::from_str(result.tag_value("request").unwrap()).unwrap();
    assert_eq!(embedded.id, free.id);

    // Paid summarization waits for the wallet
    let paid = request(&alice, 5001, "a long story");
    relay.send(&paid);
    eventually("invoice", || {
        registry.status(&paid.id) == Some(JobStatus::AwaitingPayment)
    })
    .await;
    let payment_requests = |relay: &MemoryRelay| -> Vec<Event> {
        relay
            .published_kind(7000)
            .into_iter()
            .filter(|e| e.tag_value("status") == Some("payment-required"))
            .collect()
    };
    let relay_view = relay.clone();
    eventually("payment request", || !payment_requests(&relay_view).is_empty()).await;

    let asks = payment_requests(&relay);
    assert_eq!(asks.len(), 1);
    let ask = &asks[0];
    assert!(verify_event(ask).unwrap());
    assert_eq!(ask.tag_value("status"), Some("payment-required"));
    assert_eq!(ask.tag_value("amount"), Some("2000"));
    assert!(relay.published_kind(6001).is_empty());

    wallet.paid.store(true, Ordering::SeqCst);
    eventually("paid job", || registry.status(&paid.id) == Some(JobStatus::Completed)).await;

    let results = relay.published_kind(6001);
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("A LONG STORY"));
    assert_eq!(results[0].tag_value("amount"), Some("2000"));

    let mut saw_payment = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::PaymentReceived { job_id, amount_msats, .. } = event {
            saw_payment |= job_id == paid.id && amount_msats == 2_000;
        }
    }
    assert!(saw_payment);

    engine.stop().await.unwrap();
    assert_eq!(engine.task_count(), 0);
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dvm.toml");

    let original = config();
    original.save_to(&path).unwrap();
    let loaded = DvmConfig::load_from(&path).unwrap();

    assert_eq!(loaded, original);
    assert_eq!(loaded.price_for(5001), 2_000);
    assert_eq!(loaded.required_payment(5050, "anyone"), None);
}
