//! Tracing initialization and subscriber setup.
//!
//! The subscriber is assembled from three layers:
//!
//! ```text
//! registry ── EnvFilter (RUST_LOG, else Config::trace_level, else "info")
//!          ── fmt layer ──► stderr | rotating log file (Config::log_file)
//!          ── OpenTelemetry layer ──► OTLP JSON file (Config::trace_export, optional)
//! ```

use super::file_writer::{FileWriter, SharedFileWriter};
use super::tracer::{self, SCOPE};
use crate::Config;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::resource::Resource;
use std::sync::Arc;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive when neither `RUST_LOG` nor the config set one.
const DEFAULT_LEVEL: &str = "info";

/// Installs the global tracing subscriber.
///
/// # Level Resolution
///
/// 1. `RUST_LOG`, when set and valid
/// 2. `config.trace_level`
/// 3. `"info"`
///
/// # Initialization Behavior
///
/// - Log and trace files are created lazily, parent directories included
/// - Idempotent: only the first call installs a subscriber
///
/// Returns `true` if this call installed the subscriber.
///
/// # Example
///
/// ```rust
/// use canopy::observability::init_tracing;
/// use canopy::Config;
///
/// let config = Config {
///     trace_level: Some("debug".to_string()),
///     ..Config::default()
/// };
/// init_tracing(&config);
/// assert!(!init_tracing(&config));
/// ```
pub fn init_tracing(config: &Config) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.trace_level.as_deref().unwrap_or(DEFAULT_LEVEL);
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    });

    let (writer, ansi) = match &config.log_file {
        Some(path) => {
            let file = Arc::new(FileWriter::new(path.clone()));
            (BoxMakeWriter::new(SharedFileWriter(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_names(true);

    let otel_layer = config.trace_export.as_ref().map(|path| {
        let resource = Resource::new(vec![
            opentelemetry::KeyValue::new("service.name", SCOPE),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]);
        let provider = tracer::create_tracer_provider(Arc::new(FileWriter::new(path.clone())), resource);
        OpenTelemetryLayer::new(provider.tracer(SCOPE))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .is_ok()
}
