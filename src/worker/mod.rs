//! Background threads for state detection.
//!
//! Installing a component detects its fields and merges the parent state
//! into it. For regular components this work runs on a detection worker so
//! the main context stays free; the result comes back as a [`MainTask`] that
//! the [`Runtime`](crate::infrastructure::Runtime) pumps.
//!
//! # Architecture
//!
//! - `messages`: jobs and results crossing threads, with trace context propagation
//! - `handler`: the detection function and the worker pool running it

pub mod handler;
pub mod messages;

pub use handler::{detect, DetectionWorker};
pub use messages::{DetectionJob, GlobalSnapshot, MainTask, TraceContext};
