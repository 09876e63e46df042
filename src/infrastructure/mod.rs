//! Infrastructure layer: the runtime, the platform handle and path helpers.
//!
//! This is where the engine meets its host process: the [`Runtime`] owns the
//! main context's task queue and helper threads, the [`Platform`] carries
//! host capabilities to components, and [`paths`] resolves file locations
//! for configuration and logs.

pub mod paths;
pub mod platform;
pub mod runtime;

pub use paths::{data_dir, expand_tilde};
pub use platform::Platform;
pub use runtime::Runtime;
