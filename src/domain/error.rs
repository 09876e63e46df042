//! Error types for the canopy state engine.
//!
//! This module defines the centralized error type [`CanopyError`] and a type alias
//! [`Result`] for convenient error handling throughout the crate. All errors are
//! implemented using the `thiserror` crate for automatic `Error` trait implementation.
//!
//! Operations on a detached [`DispatchBus`](crate::bus::DispatchBus) are not
//! represented here: they are silently ignored and only traced.

use thiserror::Error;

/// The main error type for canopy operations.
///
/// Variants fall into two groups. Programming errors detected synchronously
/// during dispatch (`NotInReducer`, `ActionScope`, `ReducerInvariant`,
/// `DependencyCycle`) fail fast and are propagated to the caller. Effect
/// failures (`EffectExecution`) are contained per handler: they are logged
/// and collected into an [`EffectReport`](crate::effect::EffectReport), never
/// returned as the error of a dispatch.
///
/// # Examples
///
/// ```
/// use canopy::domain::CanopyError;
///
/// fn write_outside_reducer() -> Result<(), CanopyError> {
///     Err(CanopyError::NotInReducer { key: "count".to_string() })
/// }
///
/// assert!(write_outside_reducer().is_err());
/// ```
#[derive(Debug, Error)]
pub enum CanopyError {
    /// A prop was written while its state was not recording.
    ///
    /// Props may only change inside a reducer or an explicit scoped update.
    #[error("prop `{key}` written outside of a reducer")]
    NotInReducer {
        /// Key of the prop that was written.
        key: String,
    },

    /// An action or a write crossed a scope it is not allowed to cross.
    ///
    /// Raised for private actions handed to a public-only API (broadcast,
    /// interception, page fan-out) and for writes to a prop owned by a
    /// global store.
    #[error("action scope violation: {0}")]
    ActionScope(String),

    /// A reducer failed while handling an action.
    ///
    /// Treated as a broken state invariant: the dispatch is rolled back and
    /// the error is propagated to the dispatcher.
    #[error("reducer for `{action}` failed: {reason}")]
    ReducerInvariant {
        /// Name of the action being reduced.
        action: String,
        /// Description of the failure.
        reason: String,
    },

    /// An effect or interceptor handler failed or panicked.
    #[error("effect for `{action}` failed: {reason}")]
    EffectExecution {
        /// Name of the action being handled.
        action: String,
        /// Description of the failure (error message or panic payload).
        reason: String,
    },

    /// Binding a prop to a root would make it depend on itself.
    #[error("binding prop `{key}` would create a dependency cycle")]
    DependencyCycle {
        /// Key of the prop being bound.
        key: String,
    },

    /// No prop with the given key exists in the state.
    #[error("unknown prop `{key}` in state `{state}`")]
    UnknownProp {
        /// Key that was looked up.
        key: String,
        /// Name of the state that was searched.
        state: String,
    },

    /// A prop value could not be converted to or from the requested type.
    #[error("prop `{key}` has an incompatible type: {source}")]
    PropType {
        /// Key of the prop being converted.
        key: String,
        /// Underlying serde conversion error.
        #[source]
        source: serde_json::Error,
    },

    /// Field discovery or state merge failed during install.
    ///
    /// The component stays in its detecting state and never becomes ready.
    #[error("state detection failed: {0}")]
    Detection(String),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or I/O operation failed.
    ///
    /// Wraps errors from standard library I/O operations (log files, worker
    /// thread spawning).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanopyError {
    /// Builds an [`CanopyError::ActionScope`] error for a private action used
    /// where only public actions are accepted.
    pub(crate) fn private_action(operation: &str, action: &str) -> Self {
        Self::ActionScope(format!(
            "private action `{action}` cannot be used with {operation}"
        ))
    }
}

/// A specialized `Result` type for canopy operations.
///
/// # Examples
///
/// ```
/// use canopy::domain::Result;
///
/// fn reduce_nothing() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, CanopyError>;
