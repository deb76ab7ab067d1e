//! Logging setup and the telemetry sink.
//!
//! Environment variables:
//! - `RUST_LOG` - Log filter directive (default: "info")
//! - `LOG_FORMAT` - Output format: "json" or "pretty" (default: "pretty")

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
    };

    match result {
        Ok(()) => tracing::debug!(app = name, "logging initialized"),
        Err(_) => tracing::debug!(app = name, "logging already initialized"),
    }
}

/// Fire-and-forget usage/diagnostic sink.
///
/// Implementations must never block or fail the caller.
pub trait Telemetry: Send + Sync {
    fn record(&self, category: &str, action: &str, label: Option<&str>, value: Option<f64>);
}

/// Emits each record as a structured tracing event under the `telemetry`
/// target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&self, category: &str, action: &str, label: Option<&str>, value: Option<f64>) {
        tracing::info!(
            target: "telemetry",
            category,
            action,
            label = label.unwrap_or_default(),
            value = value.unwrap_or_default(),
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record(&self, _category: &str, _action: &str, _label: Option<&str>, _value: Option<f64>) {}
}

pub mod categories {
    pub const LISTENER: &str = "dvm:listener";
    pub const JOB: &str = "dvm:job";
    pub const PAYMENT: &str = "dvm:payment";
    pub const PUBLISH: &str = "dvm:publish";
}
