//! Logging and tracing for the engine and its helper threads.
//!
//! Every layer of the crate is instrumented with `tracing` spans and events:
//! dispatch, propagation, batch ticks, installs, detection jobs and bus
//! traffic. This module wires those into a subscriber.
//!
//! # Architecture
//!
//! ```text
//! tracing macros ─► EnvFilter ─┬─► fmt layer ─► stderr | FileWriter (rotating)
//!                              └─► tracing-opentelemetry ─► SDK ─► FileSpanExporter ─► OTLP JSON
//! ```
//!
//! Detection jobs carry the scheduling span's trace context, so a worker's
//! span joins the trace of the install that scheduled it.
//!
//! # Features
//!
//! - **Rotation**: files rotate at 10MB with 3-backup retention
//! - **OTLP format**: trace export is opt-in through `Config::trace_export`
//!
//! # Modules
//!
//! - [`init`]: subscriber setup
//! - [`file_writer`]: rotating file writer and its `MakeWriter` adapter
//! - `tracer`: OpenTelemetry provider with file export (internal)
//! - `span_formatter`: OTLP JSON encoding (internal)

pub mod file_writer;
pub mod init;
mod span_formatter;
mod tracer;

pub use file_writer::{FileWriter, SharedFileWriter};
pub use init::init_tracing;
