//! Domain layer for the canopy state engine.
//!
//! This module contains the vocabulary shared by every other layer: actions,
//! payloads and the error taxonomy. It has no knowledge of stores, buses or
//! threads.
//!
//! # Organization
//!
//! - [`action`]: Action identifiers and payloads
//! - [`error`]: Error types and result aliases
//!
//! # Examples
//!
//! ```
//! use canopy::domain::{Action, CanopyError, Result};
//!
//! fn reject_private(action: &Action) -> Result<()> {
//!     if action.is_private() {
//!         return Err(CanopyError::ActionScope(action.name().to_string()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(reject_private(&Action::private("increment")).is_err());
//! ```

pub mod action;
pub mod error;

pub use action::{Action, Payload};
pub use error::{CanopyError, Result};
